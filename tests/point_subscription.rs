use std::time::Duration;

use changefeed::config::ChangefeedConfig;
use changefeed::mailbox::MailboxManager;
use changefeed::subscriber::{Client, Interruptor, Subscription};
use changefeed::testutil::MockNamespace;
use serde_json::json;

#[tokio::test]
async fn point_subscription_sees_update_after_start() {
    let mailboxes = MailboxManager::new();
    let ns = MockNamespace::new("id", mailboxes.clone());
    ns.insert(json!({"id": "k1", "v": 1})).await.expect("insert");

    let client = Client::new();
    let (feed, sub) = client
        .new_point_subscription(
            "widgets",
            json!("k1"),
            ns.clone(),
            mailboxes.clone(),
            "id".to_string(),
            ChangefeedConfig::default(),
        )
        .await
        .expect("subscribe");

    ns.insert(json!({"id": "k1", "v": 2})).await.expect("update");
    let interruptor = Interruptor::new();
    let els = sub.get_els(10, Duration::from_secs(1), &interruptor).await.expect("update batch");
    assert_eq!(els.len(), 1);
    assert_eq!(els[0]["old_val"], json!({"id": "k1", "v": 1}));
    assert_eq!(els[0]["new_val"], json!({"id": "k1", "v": 2}));

    client.detach_point("widgets", &feed, &sub);
}

#[tokio::test]
async fn point_subscription_ignores_unrelated_keys() {
    let mailboxes = MailboxManager::new();
    let ns = MockNamespace::new("id", mailboxes.clone());
    ns.insert(json!({"id": "k1", "v": 1})).await.expect("insert");

    let client = Client::new();
    let (feed, sub) = client
        .new_point_subscription(
            "widgets",
            json!("k1"),
            ns.clone(),
            mailboxes.clone(),
            "id".to_string(),
            ChangefeedConfig::default(),
        )
        .await
        .expect("subscribe");

    ns.insert(json!({"id": "other", "v": 99})).await.expect("unrelated insert");
    let interruptor = Interruptor::new();
    let els = sub.get_els(10, Duration::from_millis(50), &interruptor).await.expect("timeout batch");
    assert!(els.is_empty());

    client.detach_point("widgets", &feed, &sub);
}
