use std::collections::HashSet;

use chrono::{Duration, TimeZone, Utc};

use crate::{
    domain::{
        Actor, ActorId, ConversationKey, GenderTag, Message, MessageId, MessageTarget, Room,
        RoomId, RoomKind, TenantId,
    },
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, IdentityAck, ServerEvent},
};

fn direct_message(sender: &str, recipient: &str) -> Message {
    Message {
        id: MessageId::new("m-1"),
        target: MessageTarget::Direct(ActorId::new(recipient)),
        sender_id: ActorId::new(sender),
        sender_alias: sender.to_string(),
        sender_gender: GenderTag::Other,
        text: "ciao".into(),
        image_ref: None,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        tenant_id: None,
    }
}

#[test]
fn parses_conversation_keys() {
    assert_eq!(
        "room:general".parse::<ConversationKey>().unwrap(),
        ConversationKey::Room(RoomId::new("general"))
    );
    assert_eq!(
        "direct:u42".parse::<ConversationKey>().unwrap(),
        ConversationKey::Direct(ActorId::new("u42"))
    );
    assert!("general".parse::<ConversationKey>().is_err());
    assert!("room:".parse::<ConversationKey>().is_err());
    assert_eq!(ConversationKey::room("general").to_string(), "room:general");
}

#[test]
fn direct_message_key_is_the_other_participant() {
    let me = ActorId::new("alice");
    let outgoing = direct_message("alice", "bob");
    let incoming = direct_message("bob", "alice");

    assert_eq!(
        outgoing.conversation_key_for(|id| *id == me),
        ConversationKey::direct("bob")
    );
    assert_eq!(
        incoming.conversation_key_for(|id| *id == me),
        ConversationKey::direct("bob")
    );
}

#[test]
fn generated_message_ids_are_unique() {
    assert_ne!(MessageId::generate(), MessageId::generate());
}

#[test]
fn server_events_use_tagged_payloads() {
    let event = ServerEvent::IdentityAssigned(IdentityAck {
        id: ActorId::new("u42"),
        alias: "Guest-abc".into(),
        tenant_id: None,
    });
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "identity_assigned");
    assert_eq!(json["payload"]["id"], "u42");

    let raw = r#"{"type":"message_deleted","payload":{"message_id":"m-9"}}"#;
    let decoded: ServerEvent = serde_json::from_str(raw).unwrap();
    assert_eq!(
        decoded,
        ServerEvent::MessageDeleted {
            message_id: MessageId::new("m-9"),
            conversation_key: None,
        }
    );
}

#[test]
fn client_request_kind_names_match_wire_tags() {
    let request = ClientRequest::DeleteMessage {
        message_id: MessageId::new("m-1"),
        room_id: None,
        tenant_slug: "bar-centrale".into(),
    };
    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(json["type"], request.kind());
}

#[test]
fn api_error_flags_auth_failures() {
    assert!(ApiError::new(ErrorCode::Forbidden, "nope").is_auth_failure());
    assert!(!ApiError::new(ErrorCode::RateLimited, "slow down").is_auth_failure());
}

#[test]
fn room_kind_uses_upper_case_tags() {
    let room: Room = serde_json::from_value(serde_json::json!({
        "id": "news",
        "tenant_id": "t1",
        "name": "News",
        "kind": "ANNOUNCEMENT"
    }))
    .unwrap();
    assert_eq!(room.kind, RoomKind::Announcement);
    assert_eq!(room.tenant_id, TenantId::new("t1"));

    let plain: Room =
        serde_json::from_str(r#"{"id":"general","tenant_id":"t1","name":"General"}"#).unwrap();
    assert_eq!(plain.kind, RoomKind::Standard);
}

#[test]
fn actor_summaries_dedupe_in_sets() {
    let mut ana = Actor::anonymous(ActorId::new("u1"), "Ana");
    ana.gender = GenderTag::Female;
    let mut online = HashSet::new();
    assert!(online.insert(ana.summary()));
    assert!(!online.insert(ana.summary()));

    ana.gender = GenderTag::Other;
    assert!(online.insert(ana.summary()));
    assert_eq!(online.len(), 2);
}

#[test]
fn normalized_message_drops_sub_millisecond_precision() {
    let mut message = direct_message("u1", "u2");
    message.timestamp = message.timestamp + Duration::microseconds(1_600);

    let normalized = message.clone().normalized();
    assert_eq!(
        normalized.timestamp,
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::milliseconds(1)
    );
    assert_eq!(
        normalized.timestamp.timestamp_millis(),
        message.timestamp.timestamp_millis()
    );
    assert_eq!(normalized.clone().normalized(), normalized);
}
