use std::time::Duration;

use changefeed::config::ChangefeedConfig;
use changefeed::mailbox::MailboxManager;
use changefeed::subscriber::{Client, Interruptor, RangePredicate, Subscription};
use changefeed::testutil::MockNamespace;
use serde_json::json;

/// A range subscription whose buffer never gets drained reports a synthetic
/// "skipped" error batch once its `array_size_limit` backlog overflows, rather than
/// growing unbounded or silently dropping rows.
#[tokio::test]
async fn overflowing_range_subscription_reports_skipped_count() {
    let mailboxes = MailboxManager::new();
    let ns = MockNamespace::new("id", mailboxes.clone());

    let client = Client::new();
    let predicate = RangePredicate { sindex: None, left: json!(null), right: None };
    let mut config = ChangefeedConfig::default();
    config.array_size_limit = 2;
    let (feed, sub) = client
        .new_range_subscription("widgets", predicate, ns.clone(), mailboxes.clone(), "id".to_string(), config)
        .await
        .expect("subscribe");

    for i in 0..5 {
        ns.insert(json!({"id": format!("k{i}")})).await.expect("insert");
    }

    let interruptor = Interruptor::new();
    let els = sub.get_els(10, Duration::from_secs(1), &interruptor).await.expect("skip batch");
    assert_eq!(els.len(), 1);
    assert!(els[0]["error"].as_str().unwrap().contains("skipped"));

    client.detach_range("widgets", &feed, &sub);
}
