//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identity of this agent installation, reported to the controller.
    AgentId,
    "agent"
);

define_id!(
    /// Id given to an action the agent inferred locally rather than
    /// receiving from the controller.
    DetectedActionId,
    "detected"
);

define_id!(
    /// Correlates one ack commit request with controller-side logs.
    RequestId,
    "req"
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_agent_id_roundtrip() {
        let id = AgentId::new();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("agent_"));
    }

    #[test]
    fn test_detected_id_rejects_agent_prefix() {
        let agent = AgentId::new().to_string();
        let err = DetectedActionId::parse(&agent).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(AgentId::parse(""), Err(crate::IdError::Empty));
        assert_eq!(
            AgentId::parse("agent01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(crate::IdError::MissingSeparator)
        );
        assert!(matches!(
            AgentId::parse("agent_invalid"),
            Err(crate::IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn test_json_is_plain_string() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_prefixes_unique() {
        let prefixes = [AgentId::PREFIX, DetectedActionId::PREFIX, RequestId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len());
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in "\\PC*") {
            let _ = AgentId::parse(&s);
        }

        #[test]
        fn roundtrip_from_raw_ulid(raw in any::<u128>()) {
            let id = AgentId(crate::Ulid::from(raw));
            prop_assert_eq!(AgentId::parse(&id.to_string()), Ok(id));
        }
    }
}
