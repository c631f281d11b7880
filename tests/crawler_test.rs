//! End-to-end crawler scenarios: happy path, dedup, retries, combined
//! sources, crawl ceilings, and migration resume.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crawlkit::request::Request;
use crawlkit::request_list::RequestList;
use crawlkit::request_queue::RequestQueue;
use crawlkit::storage::{KeyValueStore, MemoryKeyValueStore, REQUEST_LIST_STATE_KEY};
use crawlkit::{BasicCrawler, CrawlingContext, EventBus, SystemEvent};

type UrlLog = Arc<parking_lot::Mutex<Vec<String>>>;

fn url_log() -> UrlLog {
    Arc::new(parking_lot::Mutex::new(Vec::new()))
}

#[tokio::test]
async fn request_list_happy_path() {
    let list = Arc::new(RequestList::from_urls([
        "http://a/1",
        "http://a/2",
        "http://a/3",
    ]));
    let processed = url_log();

    let processed_clone = Arc::clone(&processed);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    assert_eq!(
        *processed.lock(),
        vec!["http://a/1", "http://a/2", "http://a/3"]
    );
    let stats = crawler.statistics();
    assert_eq!(stats.requests_finished, 3);
    assert_eq!(stats.requests_failed, 0);
    assert_eq!(crawler.handled_count(), 3);
}

#[tokio::test]
async fn duplicate_urls_collapse_to_one_request() {
    let list = Arc::new(RequestList::from_urls([
        "http://a/1",
        "http://a/1#frag",
        "http://a/1",
    ]));
    let processed = url_log();

    let processed_clone = Arc::clone(&processed);
    let crawler = BasicCrawler::builder()
        .request_list(Arc::clone(&list))
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    assert_eq!(list.len(), 1);
    assert_eq!(processed.lock().len(), 1);
}

#[tokio::test]
async fn failing_attempts_retry_then_succeed() {
    let list = Arc::new(RequestList::from_urls(["http://a/1"]));
    let attempts = Arc::new(AtomicU32::new(0));
    let success_retry_count = Arc::new(AtomicU32::new(u32::MAX));
    let success_error_count = Arc::new(AtomicU32::new(u32::MAX));

    let attempts_clone = Arc::clone(&attempts);
    let retry_clone = Arc::clone(&success_retry_count);
    let errors_clone = Arc::clone(&success_error_count);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .max_request_retries(3)
        .handle_request_function(move |ctx: CrawlingContext| {
            let attempts = Arc::clone(&attempts_clone);
            let retry_count = Arc::clone(&retry_clone);
            let error_count = Arc::clone(&errors_clone);
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    anyhow::bail!("flaky backend (attempt {attempt})");
                }
                let request = ctx.request.lock().await;
                retry_count.store(request.retry_count(), Ordering::SeqCst);
                error_count.store(request.error_messages().len() as u32, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(success_retry_count.load(Ordering::SeqCst), 2);
    assert_eq!(success_error_count.load(Ordering::SeqCst), 2);

    let stats = crawler.statistics();
    assert_eq!(stats.requests_finished, 1);
    assert_eq!(stats.requests_failed, 0);
    // One request finished at retry two.
    assert_eq!(stats.request_retry_histogram, vec![0, 0, 1]);
}

#[tokio::test]
async fn exhausted_retries_invoke_the_failed_handler_once() {
    let list = Arc::new(RequestList::from_urls(["http://a/1"]));
    let attempts = Arc::new(AtomicU32::new(0));
    let failed_calls = Arc::new(AtomicU32::new(0));
    let failed_error_messages = Arc::new(AtomicU32::new(0));

    let attempts_clone = Arc::clone(&attempts);
    let failed_clone = Arc::clone(&failed_calls);
    let messages_clone = Arc::clone(&failed_error_messages);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .max_request_retries(2)
        .handle_request_function(move |_ctx: CrawlingContext| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("permanently broken")
            }
        })
        .handle_failed_request_function(move |ctx: CrawlingContext, error: anyhow::Error| {
            let failed = Arc::clone(&failed_clone);
            let messages = Arc::clone(&messages_clone);
            async move {
                failed.fetch_add(1, Ordering::SeqCst);
                let request = ctx.request.lock().await;
                messages.store(request.error_messages().len() as u32, Ordering::SeqCst);
                assert!(error.to_string().contains("permanently broken"));
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    // Attempts at retry 0, 1, 2 — then terminal failure.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(failed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(failed_error_messages.load(Ordering::SeqCst), 3);

    let stats = crawler.statistics();
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_finished, 0);
}

#[tokio::test]
async fn list_feeds_the_queue_and_goes_first() {
    let list = Arc::new(RequestList::from_urls(["http://a/1"]));
    let queue = Arc::new(
        RequestQueue::new().with_timings(Duration::from_millis(5), Duration::from_millis(5)),
    );
    queue
        .add_request(Request::new("http://b/2").expect("valid URL"), false)
        .await
        .expect("seed queue");

    let processed = url_log();
    let processed_clone = Arc::clone(&processed);
    let crawler = BasicCrawler::builder()
        .request_list(Arc::clone(&list))
        .request_queue(Arc::clone(&queue))
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    // The list request is transferred to the queue's forefront and
    // therefore processed before the queue's own entry.
    assert_eq!(*processed.lock(), vec!["http://a/1", "http://b/2"]);
    assert!(list.is_finished().await.expect("list finished"));
    assert_eq!(queue.handled_count().await.expect("count"), 2);
}

#[tokio::test]
async fn max_requests_per_crawl_drains_in_flight_work() {
    let urls: Vec<String> = (0..100).map(|i| format!("http://a/{i}")).collect();
    let list = Arc::new(RequestList::from_urls(urls));
    let processed = url_log();

    let processed_clone = Arc::clone(&processed);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .max_requests_per_crawl(10)
        .min_concurrency(4)
        .max_concurrency(4)
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                tokio::time::sleep(Duration::from_millis(20)).await;
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    let handled = crawler.handled_count();
    assert!(
        (10..=13).contains(&handled),
        "expected the ceiling plus at most three in-flight requests, got {handled}"
    );
}

#[tokio::test]
async fn migration_checkpoint_resumes_with_the_remaining_requests() {
    let urls: Vec<String> = (0..10).map(|i| format!("http://a/{i}")).collect();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let bus = Arc::new(EventBus::default());

    let first_processed = url_log();
    let first_list = RequestList::builder()
        .sources(urls.clone())
        .store(Arc::clone(&store))
        .build();

    let processed_clone = Arc::clone(&first_processed);
    let first_crawler = BasicCrawler::builder()
        .request_list(Arc::new(first_list))
        .store(Arc::clone(&store))
        .event_bus(Arc::clone(&bus))
        .min_concurrency(3)
        .max_concurrency(3)
        .safe_migration_wait(Duration::from_secs(5))
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                tokio::time::sleep(Duration::from_millis(100)).await;
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    let handle = first_crawler.handle();
    let first_run = tokio::spawn(async move {
        let result = first_crawler.run().await;
        (result, first_crawler.statistics())
    });

    // Let a couple of requests finish, then signal migration.
    while handle.handled_count() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bus.publish(SystemEvent::Migrating).expect("subscribed");

    // The migration handler pauses the pool, drains, and persists.
    loop {
        if store
            .get(REQUEST_LIST_STATE_KEY)
            .await
            .expect("store readable")
            .is_some()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The paused crawl would wait for the host to kill it; end it here.
    handle.abort();
    let (result, _) = first_run.await.expect("join");
    result.expect("aborted run still resolves");

    let first_done: HashSet<String> = first_processed.lock().iter().cloned().collect();
    assert!(first_done.len() >= 2);
    assert!(first_done.len() < 10, "migration should leave work behind");

    // A fresh crawler over the same sources and store picks up exactly
    // the remaining requests.
    let second_processed = url_log();
    let second_list = RequestList::builder()
        .sources(urls.clone())
        .store(Arc::clone(&store))
        .build();

    let processed_clone = Arc::clone(&second_processed);
    let second_crawler = BasicCrawler::builder()
        .request_list(Arc::new(second_list))
        .store(Arc::clone(&store))
        .handle_request_function(move |ctx: CrawlingContext| {
            let processed = Arc::clone(&processed_clone);
            async move {
                let url = ctx.request.lock().await.url().to_string();
                processed.lock().push(url);
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    second_crawler.run().await.expect("second run finishes");

    let second_done: HashSet<String> = second_processed.lock().iter().cloned().collect();
    let all: HashSet<String> = urls.iter().cloned().collect();

    assert!(
        first_done.is_disjoint(&second_done),
        "no request may be processed by both runs"
    );
    let union: HashSet<String> = first_done.union(&second_done).cloned().collect();
    assert_eq!(union, all);

    // Restored statistics carry the first run's counters forward.
    assert_eq!(second_crawler.statistics().requests_finished, 10);
}

#[tokio::test]
async fn handler_timeout_is_an_attempt_failure() {
    let list = Arc::new(RequestList::from_urls(["http://a/slow"]));
    let attempts = Arc::new(AtomicU32::new(0));
    let failed_calls = Arc::new(AtomicU32::new(0));

    let attempts_clone = Arc::clone(&attempts);
    let failed_clone = Arc::clone(&failed_calls);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .max_request_retries(1)
        .handle_request_timeout(Duration::from_millis(50))
        .handle_request_function(move |_ctx: CrawlingContext| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                anyhow::Ok(())
            }
        })
        .handle_failed_request_function(move |_ctx: CrawlingContext, error: anyhow::Error| {
            let failed = Arc::clone(&failed_clone);
            async move {
                failed.fetch_add(1, Ordering::SeqCst);
                assert!(error.to_string().contains("timed out"));
                anyhow::Ok(())
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(failed_calls.load(Ordering::SeqCst), 1);
    assert_eq!(crawler.statistics().requests_failed, 1);
}

#[tokio::test]
async fn no_retry_requests_fail_on_first_error() {
    let list = Arc::new(RequestList::from_urls(["http://a/1"]));
    let attempts = Arc::new(AtomicU32::new(0));

    let attempts_clone = Arc::clone(&attempts);
    let crawler = BasicCrawler::builder()
        .request_list(list)
        .max_request_retries(5)
        .handle_request_function(move |ctx: CrawlingContext| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                ctx.request.lock().await.no_retry = true;
                anyhow::bail!("do not bother retrying")
            }
        })
        .build()
        .expect("valid configuration");

    crawler.run().await.expect("crawl finishes");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(crawler.statistics().requests_failed, 1);
}
