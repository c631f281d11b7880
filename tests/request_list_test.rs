//! Request list integration tests: remote sources, checkpointing, and
//! property-based invariants.

use std::collections::HashSet;
use std::sync::Arc;

use crawlkit::request_list::{RemoteUrlSource, RequestList, RequestListError, RequestListSource};
use crawlkit::storage::{KeyValueStore, MemoryKeyValueStore};

#[tokio::test]
async fn loads_urls_from_remote_source() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/urls.txt")
        .with_status(200)
        .with_body("http://example.com/1\nhttp://example.com/2\nhttp://example.com/1\n")
        .create_async()
        .await;

    let list = RequestList::builder()
        .source(RequestListSource::RemoteUrl(RemoteUrlSource {
            requests_from_url: format!("{}/urls.txt", server.url()),
            regex: None,
        }))
        .build();
    list.initialize().await.expect("initialize");

    mock.assert_async().await;
    // The duplicate URL collapses.
    assert_eq!(list.len(), 2);
}

#[tokio::test]
async fn remote_source_with_custom_regex() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/data.json")
        .with_status(200)
        .with_body(r#"{"items": ["http://example.com/a", "http://example.com/b"]}"#)
        .create_async()
        .await;

    let list = RequestList::builder()
        .source(RequestListSource::RemoteUrl(RemoteUrlSource {
            requests_from_url: format!("{}/data.json", server.url()),
            regex: Some(r"http://example\.com/[ab]".to_string()),
        }))
        .build();
    list.initialize().await.expect("initialize");
    assert_eq!(list.len(), 2);
}

#[tokio::test]
async fn remote_fetch_failure_surfaces() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/urls.txt")
        .with_status(500)
        .create_async()
        .await;

    let list = RequestList::builder()
        .source(RequestListSource::RemoteUrl(RemoteUrlSource {
            requests_from_url: format!("{}/urls.txt", server.url()),
            regex: None,
        }))
        .build();

    assert!(matches!(
        list.initialize().await,
        Err(RequestListError::RemoteFetch { .. })
    ));
}

#[tokio::test]
async fn remote_sources_preserve_declaration_order() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/urls.txt")
        .with_status(200)
        .with_body("http://example.com/remote\n")
        .create_async()
        .await;

    let list = RequestList::builder()
        .source("http://example.com/before")
        .source(RequestListSource::RemoteUrl(RemoteUrlSource {
            requests_from_url: format!("{}/urls.txt", server.url()),
            regex: None,
        }))
        .source("http://example.com/after")
        .build();
    list.initialize().await.expect("initialize");

    let mut urls = Vec::new();
    while let Some(request) = list.fetch_next_request().await.expect("fetch") {
        urls.push(request.url().to_string());
        list.mark_request_handled(&request).await.expect("mark");
    }
    assert_eq!(
        urls,
        vec![
            "http://example.com/before",
            "http://example.com/remote",
            "http://example.com/after"
        ]
    );
}

#[tokio::test]
async fn sources_function_appends_after_inline_sources() {
    let list = RequestList::builder()
        .source("http://example.com/inline")
        .sources_function(Box::new(|| {
            Box::pin(async {
                Ok(vec![RequestListSource::Url(
                    "http://example.com/dynamic".to_string(),
                )])
            })
        }))
        .build();
    list.initialize().await.expect("initialize");

    let first = list
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("some");
    let second = list
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("some");
    assert_eq!(first.url(), "http://example.com/inline");
    assert_eq!(second.url(), "http://example.com/dynamic");
}

#[tokio::test]
async fn checkpoint_round_trip_resumes_where_it_left_off() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let urls = [
        "http://example.com/1",
        "http://example.com/2",
        "http://example.com/3",
        "http://example.com/4",
    ];

    let first_run = RequestList::builder()
        .sources(urls)
        .store(Arc::clone(&store))
        .build();
    first_run.initialize().await.expect("initialize");

    // Resolve two requests, leave one mid-flight, then checkpoint.
    let a = first_run.fetch_next_request().await.expect("fetch").expect("some");
    first_run.mark_request_handled(&a).await.expect("mark");
    let b = first_run.fetch_next_request().await.expect("fetch").expect("some");
    first_run.mark_request_handled(&b).await.expect("mark");
    let c = first_run.fetch_next_request().await.expect("fetch").expect("some");
    first_run.persist_state().await.expect("persist");
    drop(c);

    let second_run = RequestList::builder()
        .sources(urls)
        .store(Arc::clone(&store))
        .build();
    second_run.initialize().await.expect("initialize");

    // The mid-flight request is redelivered, then the remaining fresh
    // one; the two already-handled requests never reappear.
    let mut remaining = HashSet::new();
    while let Some(request) = second_run.fetch_next_request().await.expect("fetch") {
        remaining.insert(request.url().to_string());
        second_run
            .mark_request_handled(&request)
            .await
            .expect("mark");
    }
    assert_eq!(
        remaining,
        HashSet::from([
            "http://example.com/3".to_string(),
            "http://example.com/4".to_string()
        ])
    );
    assert!(second_run.is_finished().await.expect("is_finished"));
}

#[tokio::test]
async fn shifted_sources_invalidate_the_checkpoint() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());

    let first_run = RequestList::builder()
        .sources(["http://example.com/1", "http://example.com/2"])
        .store(Arc::clone(&store))
        .persist_requests_key("UNUSED_SNAPSHOT_A")
        .build();
    first_run.initialize().await.expect("initialize");
    let request = first_run.fetch_next_request().await.expect("fetch").expect("some");
    first_run.mark_request_handled(&request).await.expect("mark");
    first_run.persist_state().await.expect("persist");

    // Same state key, different sources and a different snapshot key,
    // so the requests are reloaded from the (changed) declarations.
    let second_run = RequestList::builder()
        .sources(["http://example.com/other"])
        .store(Arc::clone(&store))
        .persist_requests_key("UNUSED_SNAPSHOT_B")
        .build();
    assert!(matches!(
        second_run.initialize().await,
        Err(RequestListError::InconsistentState(_))
    ));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime builds")
    }

    proptest! {
        /// A list built from arbitrary sources yields exactly the
        /// distinct unique keys, in first-occurrence order.
        #[test]
        fn dedup_preserves_first_occurrence_order(indices in prop::collection::vec(0u8..20, 1..60)) {
            let urls: Vec<String> = indices
                .iter()
                .map(|i| format!("http://example.com/page/{i}"))
                .collect();

            let mut expected = Vec::new();
            let mut seen = HashSet::new();
            for url in &urls {
                if seen.insert(url.clone()) {
                    expected.push(url.clone());
                }
            }

            runtime().block_on(async {
                let list = RequestList::from_urls(urls.clone());
                list.initialize().await.expect("initialize");
                prop_assert_eq!(list.len(), expected.len());

                let mut delivered = Vec::new();
                while let Some(request) = list.fetch_next_request().await.expect("fetch") {
                    delivered.push(request.url().to_string());
                    list.mark_request_handled(&request).await.expect("mark");
                }
                prop_assert_eq!(delivered, expected);
                Ok(())
            })?;
        }

        /// Under any interleaving of fetch / reclaim / mark, the list
        /// invariants hold: reclaimed ⊆ in-progress and the handled
        /// count never exceeds the delivered count.
        #[test]
        fn bookkeeping_invariants_hold(ops in prop::collection::vec(0u8..3, 1..100)) {
            runtime().block_on(async {
                let urls: Vec<String> =
                    (0..10).map(|i| format!("http://example.com/{i}")).collect();
                let list = RequestList::from_urls(urls);
                list.initialize().await.expect("initialize");

                let mut held = Vec::new();
                for op in ops {
                    match op {
                        0 => {
                            if let Some(request) =
                                list.fetch_next_request().await.expect("fetch")
                            {
                                held.push(request);
                            }
                        }
                        1 => {
                            if let Some(request) = held.pop() {
                                list.reclaim_request(&request).await.expect("reclaim");
                            }
                        }
                        _ => {
                            if let Some(request) = held.pop() {
                                list.mark_request_handled(&request).await.expect("mark");
                            }
                        }
                    }
                    prop_assert!(list.handled_count() <= 10);
                    let state = list.get_state();
                    prop_assert!(state.next_index <= 10);
                    prop_assert!(state.in_progress.len() <= state.next_index);
                }
                Ok(())
            })?;
        }
    }
}
