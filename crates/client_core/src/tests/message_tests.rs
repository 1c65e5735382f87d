use super::*;
use chrono::TimeZone;
use shared::domain::AttachmentId;

fn person(id: &str) -> PersonRef {
    PersonRef {
        id: UserId::new(id),
        username: id.to_string(),
    }
}

fn payload(id: &str, sender: &str, body: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::new(id),
        room_id: ConversationId::new("room-1"),
        sender: person(sender),
        body: body.to_string(),
        attachments: Vec::new(),
        forwarded_message: None,
        message_type: None,
        deleted: false,
        edited: false,
        created_at: Utc
            .with_ymd_and_hms(2024, 3, 1, 10, 0, 0)
            .single()
            .expect("valid time"),
        updated_at: None,
        edited_at: None,
        unread: Some(true),
        emotions: Vec::new(),
        mentions: Vec::new(),
        keyboard: None,
        urls: Vec::new(),
    }
}

fn attachment(id: &str, kind: AttachmentKind) -> AttachmentPayload {
    AttachmentPayload {
        id: AttachmentId::new(id),
        kind,
        filename: format!("{id}.bin"),
        link: String::new(),
        preview: String::new(),
        size: 1,
        height: None,
        width: None,
        title: None,
        mime_type: "application/octet-stream".to_string(),
    }
}

fn holders(message: &Message, emotion: &str) -> Vec<String> {
    message
        .reactions()
        .iter()
        .find(|reaction| reaction.emotion == emotion)
        .map(|reaction| reaction.users().iter().map(ToString::to_string).collect())
        .unwrap_or_default()
}

#[test]
fn toggling_same_emotion_twice_removes_user() {
    let mut message = Message::from_payload(payload("m-1", "u-2", "hi"));
    let me = UserId::new("me");

    message.toggle_reaction(&me, "like");
    assert_eq!(holders(&message, "like"), vec!["me"]);

    message.toggle_reaction(&me, "like");
    assert!(message.reactions().iter().all(|reaction| !reaction.has(&me)));
    assert!(message.reactions().is_empty());
}

#[test]
fn toggling_another_emotion_moves_user() {
    let mut raw = payload("m-1", "u-2", "hi");
    raw.emotions = vec![ReactionPayload {
        emotion: "like".to_string(),
        users: vec![UserId::new("u-3")],
    }];
    let mut message = Message::from_payload(raw);
    let me = UserId::new("me");

    message.toggle_reaction(&me, "like");
    message.toggle_reaction(&me, "fire");

    assert_eq!(holders(&message, "like"), vec!["u-3"]);
    assert_eq!(holders(&message, "fire"), vec!["me"]);
}

#[test]
fn reactions_from_server_are_deduplicated_and_pruned() {
    let mut raw = payload("m-1", "u-2", "hi");
    raw.emotions = vec![
        ReactionPayload {
            emotion: "like".to_string(),
            users: vec![UserId::new("u-3"), UserId::new("u-3")],
        },
        ReactionPayload {
            emotion: "sad".to_string(),
            users: Vec::new(),
        },
    ];

    let message = Message::from_payload(raw);

    assert_eq!(message.reactions().len(), 1);
    assert_eq!(holders(&message, "like"), vec!["u-3"]);
}

#[test]
fn confirm_adopts_server_id_and_keeps_local_key() {
    let mut draft = Message::draft(person("me"), ConversationId::new("room-1"), "hello");
    let key = draft.local_key();
    draft.mark_sending(true);
    draft.mark_error(Arc::new(anyhow::anyhow!("offline")));

    draft.confirm(MessageId::new("srv-1"));

    assert_eq!(draft.id().as_str(), "srv-1");
    assert_eq!(draft.local_key(), key);
    assert!(draft.is_settled());
    assert!(!draft.has_error());
}

#[test]
fn pending_match_compares_body_attachments_and_sender() {
    let mut draft = Message::draft(person("me"), ConversationId::new("room-1"), "hello");
    let incoming = Message::from_payload(payload("srv-1", "me", "hello"));
    assert!(!draft.is_pending_match(&incoming), "only sending drafts match");

    draft.mark_sending(true);
    assert!(draft.is_pending_match(&incoming));

    let other_sender = Message::from_payload(payload("srv-2", "u-2", "hello"));
    assert!(!draft.is_pending_match(&other_sender));

    let mut with_file = payload("srv-3", "me", "hello");
    with_file.attachments = vec![attachment("a-1", AttachmentKind::File)];
    assert!(!draft.is_pending_match(&Message::from_payload(with_file)));
}

#[test]
fn forward_layout_matches_on_forwarded_id() {
    let original = Message::from_payload(payload("orig", "u-2", "look"));
    let mut draft = Message::draft(person("me"), ConversationId::new("room-2"), "")
        .with_forward(Some(original.clone()));
    draft.mark_sending(true);
    assert_eq!(draft.layout(), Layout::Forward);

    let mut pushed = payload("srv-1", "me", "");
    pushed.forwarded_message = Some(Box::new(original.to_payload()));
    assert!(draft.is_pending_match(&Message::from_payload(pushed)));

    let mut elsewhere = payload("srv-2", "me", "");
    elsewhere.forwarded_message = Some(Box::new(payload("other", "u-2", "x")));
    assert!(!draft.is_pending_match(&Message::from_payload(elsewhere)));
}

#[test]
fn as_forward_unwraps_pure_forward() {
    let original = Message::from_payload(payload("orig", "u-2", "look"));
    let wrapper = Message::from_payload(payload("wrap", "me", "")).with_forward(Some(original));

    assert_eq!(wrapper.as_forward().id().as_str(), "orig");

    let plain = Message::from_payload(payload("plain", "u-2", "text"));
    let copy = plain.as_forward();
    assert_eq!(copy.id().as_str(), "plain");
    assert!(copy.forwarded.is_none());
}

#[test]
fn set_deleted_clears_body() {
    let mut message = Message::from_payload(payload("m-1", "u-2", "secret"));

    message.set_deleted();

    assert!(message.deleted);
    assert!(message.body.is_empty());
}

#[test]
fn update_keeps_local_send_state() {
    let mut draft = Message::draft(person("me"), ConversationId::new("room-1"), "hello");
    let key = draft.local_key();
    draft.mark_sending(true);

    draft.update(payload("srv-1", "me", "hello edited"));

    assert_eq!(draft.body, "hello edited");
    assert_eq!(draft.local_key(), key);
    assert!(draft.is_sending());
    assert!(draft.unread);
}

#[test]
fn summary_reports_first_attachment_kind() {
    let mut raw = payload("m-1", "u-2", "");
    raw.attachments = vec![
        attachment("a-1", AttachmentKind::Image),
        attachment("a-2", AttachmentKind::File),
    ];
    let summary = Message::from_payload(raw).last_message_summary();
    assert_eq!(summary.attachment_type, Some(LastAttachmentKind::Photo));

    let mut voice = payload("m-2", "u-2", "");
    voice.attachments = vec![attachment("a-3", AttachmentKind::Audio)];
    let summary = Message::from_payload(voice).last_message_summary();
    assert_eq!(summary.attachment_type, None);
}

#[test]
fn summary_nests_forwarded_message() {
    let original = Message::from_payload(payload("orig", "u-2", "look"));
    let wrapper = Message::from_payload(payload("wrap", "me", "")).with_forward(Some(original));

    let summary = wrapper.last_message_summary();

    let nested = summary.forwarded_message.expect("forward summarised");
    assert_eq!(nested.id.as_str(), "orig");
    assert_eq!(nested.body, "look");
}

#[test]
fn system_text_maps_to_conversation_event() {
    let system = |body: &str| {
        let mut raw = payload("s-1", "u-2", body);
        raw.message_type = Some(MessageType::System);
        Message::from_payload(raw)
    };

    assert_eq!(
        system("bob закрепил новое сообщение").system_event(),
        Some(SystemEvent::Pinned)
    );
    assert_eq!(
        system("bob открепил сообщение").system_event(),
        Some(SystemEvent::Unpinned)
    );
    assert_eq!(
        system("bob добавил пользователя carol").system_event(),
        Some(SystemEvent::MembersChanged)
    );
    assert_eq!(
        system("bob удалил пользователя carol").system_event(),
        Some(SystemEvent::MembersChanged)
    );
    assert_eq!(
        system("bob изменил название группы").system_event(),
        Some(SystemEvent::Renamed)
    );
    assert_eq!(system("bob создал группу").system_event(), None);
}

#[test]
fn plain_message_with_system_text_is_not_an_event() {
    let message = Message::from_payload(payload("m-1", "u-2", "bob открепил сообщение"));

    assert!(!message.is_system());
    assert_eq!(message.system_event(), None);
}
