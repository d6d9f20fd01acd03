// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! V2X telemetry and traffic-control wire formats.
//!
//! Inbound messages are JSON objects. Decoding is permissive: unknown fields are ignored and
//! missing or `null` fields fall back to zero/empty, so only structurally broken payloads count
//! as decode errors.

use crate::errors::DecodeError;
use crate::signal::SignalLevel;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Event type carried in the `type` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary basic safety message (`BSM`).
    Beacon,
    Emergency,
    Accident,
    Warning,
    /// Radar clutter, dropped before any spatial work.
    Noise,
    /// Anything else. Filtered like a beacon, never classified as an incident.
    #[default]
    Unknown,
}

impl MessageKind {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("bsm") || raw.eq_ignore_ascii_case("beacon") {
            MessageKind::Beacon
        } else if raw.eq_ignore_ascii_case("emergency") {
            MessageKind::Emergency
        } else if raw.eq_ignore_ascii_case("accident") {
            MessageKind::Accident
        } else if raw.eq_ignore_ascii_case("warning") {
            MessageKind::Warning
        } else if raw.eq_ignore_ascii_case("noise") {
            MessageKind::Noise
        } else {
            MessageKind::Unknown
        }
    }

    /// Incident classification for kinds that must be recorded and acted upon.
    pub fn incident(self) -> Option<Incident> {
        match self {
            MessageKind::Emergency => Some(Incident {
                event_type: "AMBULANCE_DETECTED",
                default_details: "Preempt_Traffic_Light",
                level: SignalLevel::Preemption,
            }),
            MessageKind::Accident => Some(Incident {
                event_type: "ACCIDENT_DETECTED",
                default_details: "Alert_Center",
                level: SignalLevel::Congestion,
            }),
            MessageKind::Warning => Some(Incident {
                event_type: "WARNING_DETECTED",
                default_details: "Hazard_Warning",
                level: SignalLevel::Congestion,
            }),
            MessageKind::Beacon | MessageKind::Noise | MessageKind::Unknown => None,
        }
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().map(MessageKind::parse).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incident {
    pub event_type: &'static str,
    pub default_details: &'static str,
    pub level: SignalLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct V2xMessage {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ts: f64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(deserialize_with = "null_as_default")]
    pub x: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub y: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub spd: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub env: String,
    #[serde(deserialize_with = "null_as_default")]
    pub desc: String,
}

impl V2xMessage {
    pub fn is_night(&self) -> bool {
        self.env.trim().eq_ignore_ascii_case("night")
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (self.x - x).hypot(self.y - y)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes one datagram payload.
pub fn decode(payload: &[u8]) -> Result<V2xMessage, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    OptimizeTraffic,
    SetSpeedLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlReason {
    #[serde(rename = "Ambulance_Preemption")]
    AmbulancePreemption,
    #[serde(rename = "Accident_Safety")]
    AccidentSafety,
    #[serde(rename = "Congestion_Flush")]
    CongestionFlush,
}

/// Fire-and-forget command for the downstream traffic controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: ControlAction,
    pub reason: ControlReason,
}

impl ControlCommand {
    pub const AMBULANCE_PREEMPTION: ControlCommand = ControlCommand {
        action: ControlAction::OptimizeTraffic,
        reason: ControlReason::AmbulancePreemption,
    };
    pub const SPEED_LIMIT_REDUCTION: ControlCommand = ControlCommand {
        action: ControlAction::SetSpeedLimit,
        reason: ControlReason::AccidentSafety,
    };
    pub const CONGESTION_FLUSH: ControlCommand = ControlCommand {
        action: ControlAction::OptimizeTraffic,
        reason: ControlReason::CongestionFlush,
    };

    /// Commands emitted for one feedback action at `level`, in send order.
    pub fn for_level(level: SignalLevel) -> &'static [ControlCommand] {
        match level {
            SignalLevel::None => &[],
            SignalLevel::Congestion => &[
                ControlCommand::SPEED_LIMIT_REDUCTION,
                ControlCommand::CONGESTION_FLUSH,
            ],
            SignalLevel::Preemption => &[ControlCommand::AMBULANCE_PREEMPTION],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::OptimizeTraffic => write!(f, "OPTIMIZE_TRAFFIC"),
            ControlAction::SetSpeedLimit => write!(f, "SET_SPEED_LIMIT"),
        }
    }
}

impl fmt::Display for ControlReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlReason::AmbulancePreemption => write!(f, "Ambulance_Preemption"),
            ControlReason::AccidentSafety => write!(f, "Accident_Safety"),
            ControlReason::CongestionFlush => write!(f, "Congestion_Flush"),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Action:{} Reason:{}", self.action, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_message() {
        let msg = decode(
            br#"{"id":"veh-7","ts":1700000000.5,"type":"EMERGENCY","x":3.0,"y":4.0,"spd":12.5,"env":"NIGHT","desc":"ambulance"}"#,
        )
        .unwrap();

        assert_eq!(msg.id, "veh-7");
        assert_eq!(msg.kind, MessageKind::Emergency);
        assert_eq!(msg.spd, 12.5);
        assert_eq!(msg.distance_to(0.0, 0.0), 5.0);
        assert!(msg.is_night());
        assert_eq!(msg.desc, "ambulance");
    }

    #[test]
    fn test_decode_is_permissive_about_missing_null_and_unknown_fields() {
        let msg = decode(br#"{"id":null,"type":"bsm","spd":null,"extra":{"nested":true}}"#)
            .unwrap();

        assert_eq!(msg.id, "");
        assert_eq!(msg.kind, MessageKind::Beacon);
        assert_eq!(msg.spd, 0.0);
        assert_eq!(msg.x, 0.0);
        assert_eq!(msg.env, "");
    }

    #[test]
    fn test_decode_missing_type_is_unknown() {
        let msg = decode(br#"{"id":"a"}"#).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown);
        assert!(msg.kind.incident().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(decode(b"  \n"), Err(DecodeError::Empty)));
        assert!(matches!(decode(b"{\"id\":"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(b"42"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decode(br#"{"spd":"fast"}"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_kind_parse_is_case_insensitive() {
        assert_eq!(MessageKind::parse("Emergency"), MessageKind::Emergency);
        assert_eq!(MessageKind::parse("accident"), MessageKind::Accident);
        assert_eq!(MessageKind::parse("WARNING"), MessageKind::Warning);
        assert_eq!(MessageKind::parse("NOISE"), MessageKind::Noise);
        assert_eq!(MessageKind::parse(" bsm "), MessageKind::Beacon);
        assert_eq!(MessageKind::parse("CAM"), MessageKind::Unknown);
    }

    #[test]
    fn test_incident_levels() {
        assert_eq!(
            MessageKind::Emergency.incident().unwrap().level,
            SignalLevel::Preemption
        );
        assert_eq!(
            MessageKind::Accident.incident().unwrap().level,
            SignalLevel::Congestion
        );
        assert_eq!(
            MessageKind::Warning.incident().unwrap().level,
            SignalLevel::Congestion
        );
        assert!(MessageKind::Beacon.incident().is_none());
        assert!(MessageKind::Noise.incident().is_none());
    }

    #[test]
    fn test_control_command_wire_format() {
        let encoded = ControlCommand::AMBULANCE_PREEMPTION.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            r#"{"action":"OPTIMIZE_TRAFFIC","reason":"Ambulance_Preemption"}"#
        );

        let decoded: ControlCommand =
            serde_json::from_slice(br#"{"action":"SET_SPEED_LIMIT","reason":"Accident_Safety"}"#)
                .unwrap();
        assert_eq!(decoded, ControlCommand::SPEED_LIMIT_REDUCTION);
    }

    #[test]
    fn test_commands_for_level() {
        assert!(ControlCommand::for_level(SignalLevel::None).is_empty());
        assert_eq!(
            ControlCommand::for_level(SignalLevel::Preemption),
            &[ControlCommand::AMBULANCE_PREEMPTION]
        );
        assert_eq!(
            ControlCommand::for_level(SignalLevel::Congestion),
            &[
                ControlCommand::SPEED_LIMIT_REDUCTION,
                ControlCommand::CONGESTION_FLUSH
            ]
        );
    }

    #[test]
    fn test_control_command_display() {
        assert_eq!(
            ControlCommand::CONGESTION_FLUSH.to_string(),
            "Action:OPTIMIZE_TRAFFIC Reason:Congestion_Flush"
        );
    }
}
