#![allow(dead_code)]

pub mod mock_smtp;

use std::sync::Arc;

use courier_common::{
    Campaign, CampaignStatus, ContentType, Header, Subscriber, SubscriberStatus,
};
use courier_messenger::Message;
use uuid::Uuid;

pub fn campaign() -> Arc<Campaign> {
    Arc::new(Campaign {
        id: 7,
        uuid: Uuid::parse_str("0b0e3c56-13f4-4d8c-8a38-6c6a36f8e9d2").unwrap(),
        name: "Autumn sale".to_string(),
        subject: "Autumn sale".to_string(),
        from_email: "Shop <shop@example.com>".to_string(),
        body: "<p>Hi</p>".to_string(),
        alt_body: None,
        content_type: ContentType::Html,
        template_body: None,
        messenger: "email".to_string(),
        status: CampaignStatus::Running,
        send_at: None,
        headers: vec![Header::new("X-Season", "autumn")],
        tags: vec!["sale".to_string()],
    })
}

pub fn message(messenger: &str) -> Message {
    let campaign = campaign();

    Message {
        from: campaign.from_email.clone(),
        to: vec!["reader@example.org".to_string()],
        subject: "Autumn sale".to_string(),
        content_type: ContentType::Html,
        body: b"<p>Hi Reader</p>".to_vec(),
        alt_body: None,
        headers: vec![Header::new("X-Courier-Campaign", campaign.uuid.to_string())],
        messenger: messenger.to_string(),
        campaign: Some(campaign),
        subscriber: Subscriber {
            id: 12,
            uuid: Uuid::parse_str("5c1b8f83-7d5e-4b0e-9a4a-1f0e0c9a7b21").unwrap(),
            email: "reader@example.org".to_string(),
            name: "Reader".to_string(),
            attribs: serde_json::Map::from_iter([(
                "city".to_string(),
                serde_json::Value::from("Lisbon"),
            )]),
            status: SubscriberStatus::Enabled,
        },
    }
}
