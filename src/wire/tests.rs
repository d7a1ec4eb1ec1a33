use super::frame::Frame;
use super::queue::{QueueDescriptor, dead_letter_queue};

#[test]
fn test_frame_round_trip() {
    let frame = Frame::Deliver {
        channel: 3,
        delivery_tag: 42,
        queue: "my-queue".to_string(),
        payload: b"hello".to_vec(),
        redelivered: true,
        attempt: 2,
    };
    let json = serde_json::to_string(&frame).unwrap();
    let parsed: Frame = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, frame);
}

#[test]
fn test_frame_tag_is_snake_case() {
    let json = serde_json::to_string(&Frame::HelloOk {}).unwrap();
    assert!(json.contains("\"hello_ok\""), "unexpected tag in {json}");
}

#[test]
fn test_channel_id() {
    let hello = Frame::Hello {
        vhost: "/".to_string(),
        username: "guest".to_string(),
        password: "guest".to_string(),
    };
    assert_eq!(hello.channel_id(), None);

    let ack = Frame::Ack {
        channel: 7,
        delivery_tag: 1,
    };
    assert_eq!(ack.channel_id(), Some(7));
}

#[test]
fn test_dead_letter_queue_name() {
    assert_eq!(dead_letter_queue("my-queue"), "my-queue.dlq");

    let q = QueueDescriptor::durable("jobs");
    let dlq = q.dead_letter();
    assert_eq!(dlq.name, "jobs.dlq");
    assert!(dlq.durable);
}
