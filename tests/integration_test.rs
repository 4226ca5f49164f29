//! End-to-end tests driving the session coordinator: interception, edge
//! detection, replay determinism, overrides, subruns, and degraded mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use flowtrace::error::EndpointError;
use flowtrace::registry::{NodeId, OriginToken};
use flowtrace::session::{event_channel, CallRecorded, EventReceiver, GraphEvent};
use flowtrace::storage::{SqliteStorage, Storage};
use flowtrace::{Config, SessionContext, SessionCoordinator};

async fn create_coordinator() -> (SessionCoordinator, EventReceiver) {
    let storage = Arc::new(
        SqliteStorage::new_in_memory()
            .await
            .expect("Failed to create in-memory storage"),
    );
    let (events, rx) = event_channel();
    (SessionCoordinator::new(Config::default(), storage, events), rx)
}

fn drain(rx: &mut EventReceiver) -> Vec<GraphEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[cfg(test)]
mod interception_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_edge_detected_when_output_flows_into_input() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;

        let first = coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                Some("draft"),
                json!({"prompt": "write one sentence about the launch"}),
                |_| async { Ok(json!({"completion": "The launch exceeded every forecast."})) },
            )
            .await
            .unwrap();
        assert_eq!(first.node_id, NodeId(1));
        assert!(first.sources.is_empty());

        let second = coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                Some("review"),
                json!({"prompt": "critique this: The launch exceeded every forecast."}),
                |_| async { Ok(json!({"completion": "Too optimistic."})) },
            )
            .await
            .unwrap();
        assert_eq!(second.node_id, NodeId(2));
        assert_eq!(second.sources, vec![NodeId(1)]);

        assert_eq!(
            coordinator.session_edges(&ctx.effective_id()),
            vec![(NodeId(1), NodeId(2))]
        );
    }

    #[tokio::test]
    async fn test_unrelated_calls_produce_no_edges() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;

        coordinator
            .intercept_call(&ctx, "gpt-4", None, json!({"prompt": "list three colors"}), |_| async {
                Ok(json!({"completion": "red, green, blue"}))
            })
            .await
            .unwrap();
        let second = coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                None,
                json!({"prompt": "name a composer from the romantic era"}),
                |_| async { Ok(json!({"completion": "Johannes Brahms"})) },
            )
            .await
            .unwrap();

        assert!(second.sources.is_empty());
        assert!(coordinator.session_edges(&ctx.effective_id()).is_empty());
    }

    #[tokio::test]
    async fn test_recorded_output_carries_node_origin() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;

        let recorded = coordinator
            .intercept_call(&ctx, "gpt-4", None, json!({"prompt": "say hello politely"}), |_| async {
                Ok(json!({"completion": "Good afternoon to you."}))
            })
            .await
            .unwrap();

        let origins = coordinator.registry().lookup(&recorded.output);
        assert!(origins.contains(&OriginToken::new(ctx.effective_id(), recorded.node_id)));
    }

    #[tokio::test]
    async fn test_events_emitted_for_nodes_and_edges() {
        let (coordinator, mut rx) = create_coordinator().await;
        let ctx = coordinator.start_session(Some("run")).await;

        coordinator
            .intercept_call(&ctx, "gpt-4", None, json!({"prompt": "name the tallest mountain"}), |_| async {
                Ok(json!({"completion": "Mount Everest stands tallest."}))
            })
            .await
            .unwrap();
        coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                None,
                json!({"prompt": "fact-check: Mount Everest stands tallest."}),
                |_| async { Ok(json!({"completion": "Confirmed."})) },
            )
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events[0], GraphEvent::SessionStarted { .. }));
        let nodes = events
            .iter()
            .filter(|e| matches!(e, GraphEvent::NodeCreated { .. }))
            .count();
        assert_eq!(nodes, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            GraphEvent::EdgeCreated {
                source: NodeId(1),
                target: NodeId(2),
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_failed_call_surfaces_error_and_is_not_cached() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let calls = AtomicUsize::new(0);
        let input = json!({"prompt": "a call destined to fail"});

        let result = coordinator
            .intercept_call(&ctx, "gpt-4", None, input.clone(), |_| async {
                Err(EndpointError::new("gpt-4", "rate limited"))
            })
            .await;
        assert!(result.is_err());

        let recorded = coordinator
            .intercept_call(&ctx, "gpt-4", None, input, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"completion": "recovered"}))
            })
            .await
            .unwrap();

        // Retry executed for real: nothing was cached by the failure, and the
        // error node consumed sequence number 1.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorded.node_id, NodeId(2));
    }
}

#[cfg(test)]
mod replay_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn run_pair(
        coordinator: &SessionCoordinator,
        ctx: &SessionContext,
        calls: &Arc<AtomicUsize>,
    ) -> (CallRecorded, CallRecorded) {
        let first = coordinator
            .intercept_call(
                ctx,
                "gpt-4",
                None,
                json!({"prompt": "write one sentence about the launch"}),
                {
                    let calls = Arc::clone(calls);
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"completion": "The launch exceeded every forecast."}))
                    }
                },
            )
            .await
            .unwrap();
        let second = coordinator
            .intercept_call(
                ctx,
                "gpt-4",
                None,
                json!({"prompt": "critique this: The launch exceeded every forecast."}),
                {
                    let calls = Arc::clone(calls);
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"completion": "Too optimistic."}))
                    }
                },
            )
            .await
            .unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_replay_reproduces_nodes_and_edges_without_calls() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let (first, second) = run_pair(&coordinator, &ctx, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        let (first_r, second_r) = run_pair(&coordinator, &replay_ctx, &calls).await;

        // No real calls during replay, identical graph.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(first_r.node_id, first.node_id);
        assert_eq!(second_r.node_id, second.node_id);
        assert_eq!(second_r.sources, second.sources);
        assert_eq!(
            coordinator.session_edges(&replay_ctx.effective_id()),
            vec![(NodeId(1), NodeId(2))]
        );
    }

    #[tokio::test]
    async fn test_output_override_takes_effect_on_replay() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let input = json!({"prompt": "what color is the sky today"});

        coordinator
            .intercept_call(&ctx, "gpt-4", None, input.clone(), |_| async {
                Ok(json!({"completion": "blue"}))
            })
            .await
            .unwrap();

        coordinator
            .override_output(&ctx.effective_id(), NodeId(1), &json!({"completion": "mauve"}))
            .await
            .unwrap();

        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        let recorded = coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, input, |_| async {
                panic!("override must short-circuit the real call")
            })
            .await
            .unwrap();

        assert_eq!(recorded.output.to_json(), json!({"completion": "mauve"}));
    }

    #[tokio::test]
    async fn test_output_override_propagates_to_downstream_call() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;

        // Call A, then call B with an input built from A's output, as the
        // instrumented program would.
        let a = coordinator
            .intercept_call(&ctx, "gpt-4", Some("draft"), json!({"prompt": "draft an opening line"}), |_| async {
                Ok(json!({"completion": "It was a dark and stormy night."}))
            })
            .await
            .unwrap();
        let a_text = a.output.to_json()["completion"].as_str().unwrap().to_string();
        let b = coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                Some("polish"),
                json!({"prompt": format!("polish this line: {a_text}")}),
                |_| async { Ok(json!({"completion": "A storm-dark night settled in."})) },
            )
            .await
            .unwrap();
        assert_eq!(b.sources, vec![a.node_id]);

        // The user rewrites A's output.
        coordinator
            .override_output(
                &ctx.effective_id(),
                a.node_id,
                &json!({"completion": "The sun rose gently over the harbor."}),
            )
            .await
            .unwrap();

        // Replay: A is served from the override without a real call; the
        // program rebuilds B's input from it, so B's fingerprint changes and
        // B re-executes. The edge follows the new overlapping text.
        let b_calls = AtomicUsize::new(0);
        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        let a_r = coordinator
            .intercept_call(&replay_ctx, "gpt-4", Some("draft"), json!({"prompt": "draft an opening line"}), |_| async {
                panic!("overridden call must not execute")
            })
            .await
            .unwrap();
        let a_text = a_r.output.to_json()["completion"].as_str().unwrap().to_string();
        assert_eq!(a_text, "The sun rose gently over the harbor.");

        let b_r = coordinator
            .intercept_call(
                &replay_ctx,
                "gpt-4",
                Some("polish"),
                json!({"prompt": format!("polish this line: {a_text}")}),
                |_| async {
                    b_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"completion": "Gentle sunrise over the harbor."}))
                },
            )
            .await
            .unwrap();

        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_r.node_id, b.node_id);
        assert_eq!(b_r.sources, vec![a_r.node_id]);
    }

    #[tokio::test]
    async fn test_override_without_downstream_overlap_breaks_the_edge() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;

        coordinator
            .intercept_call(&ctx, "gpt-4", None, json!({"prompt": "draft an opening line"}), |_| async {
                Ok(json!({"completion": "It was a dark and stormy night."}))
            })
            .await
            .unwrap();

        // B's input does not quote A's output at all: no containment, no
        // edge, regardless of call order.
        let b = coordinator
            .intercept_call(
                &ctx,
                "gpt-4",
                None,
                json!({"prompt": "write a closing line from scratch"}),
                |_| async { Ok(json!({"completion": "And then it ended quietly."})) },
            )
            .await
            .unwrap();

        assert!(b.sources.is_empty());
        assert!(coordinator.session_edges(&ctx.effective_id()).is_empty());
    }

    #[tokio::test]
    async fn test_input_override_reexecutes_with_edited_input() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let input = json!({"prompt": "original wording of the prompt"});
        let edited = json!({"prompt": "edited wording of the prompt"});

        coordinator
            .intercept_call(&ctx, "gpt-4", None, input.clone(), |_| async {
                Ok(json!({"completion": "v1"}))
            })
            .await
            .unwrap();

        coordinator
            .override_input(&ctx.effective_id(), NodeId(1), &edited)
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        let recorded = coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, input.clone(), {
                let seen = Arc::clone(&seen);
                move |effective| async move {
                    *seen.lock().unwrap() = Some(effective);
                    Ok(json!({"completion": "v2"}))
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_ref(), Some(&edited));
        assert_eq!(recorded.output.to_json(), json!({"completion": "v2"}));

        // Second replay hits the re-executed entry without another call.
        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        let recorded = coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, input, |_| async {
                panic!("re-executed override must be cached now")
            })
            .await
            .unwrap();
        assert_eq!(recorded.output.to_json(), json!({"completion": "v2"}));
    }

    #[tokio::test]
    async fn test_input_override_edge_survives_cached_replays() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let a_input = json!({"prompt": "write a memorable sentence"});
        let b_input = json!({"prompt": "something unrelated entirely"});

        let a = coordinator
            .intercept_call(&ctx, "gpt-4", None, a_input.clone(), |_| async {
                Ok(json!({"completion": "the quoted sentence fragment"}))
            })
            .await
            .unwrap();
        let b = coordinator
            .intercept_call(&ctx, "gpt-4", None, b_input.clone(), |_| async {
                Ok(json!({"completion": "nothing in common"}))
            })
            .await
            .unwrap();
        assert!(b.sources.is_empty());

        // Edit the second call's input so that it now quotes the first
        // call's output.
        coordinator
            .override_input(
                &ctx.effective_id(),
                b.node_id,
                &json!({"prompt": "expand on: the quoted sentence fragment"}),
            )
            .await
            .unwrap();

        // First replay re-executes the edited call and detects the edge.
        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, a_input.clone(), |_| async {
                panic!("cached call must not execute")
            })
            .await
            .unwrap();
        let b1 = coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, b_input.clone(), |_| async {
                Ok(json!({"completion": "an expansion of the quote"}))
            })
            .await
            .unwrap();
        assert_eq!(b1.sources, vec![a.node_id]);

        // Second replay is a pure cache hit on both calls; the node is still
        // recorded with the edited input, so the edge does not disappear.
        let replay_ctx = coordinator.begin_replay(ctx.root_id()).await;
        coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, a_input, |_| async {
                panic!("cached call must not execute")
            })
            .await
            .unwrap();
        let b2 = coordinator
            .intercept_call(&replay_ctx, "gpt-4", None, b_input, |_| async {
                panic!("re-executed entry must be cached now")
            })
            .await
            .unwrap();
        assert_eq!(b2.sources, vec![a.node_id]);
        assert_eq!(
            coordinator.session_edges(&replay_ctx.effective_id()),
            vec![(a.node_id, b2.node_id)]
        );
    }
}

#[cfg(test)]
mod subrun_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_subruns_share_root_cache_namespace() {
        let (coordinator, _rx) = create_coordinator().await;
        let mut ctx = coordinator.start_session(None).await;
        let input = json!({"prompt": "the same prompt in root and subrun"});
        let calls = AtomicUsize::new(0);

        coordinator
            .intercept_call(&ctx, "gpt-4", None, input.clone(), |_| async {
                Ok(json!({"completion": "answered once"}))
            })
            .await
            .unwrap();

        let scope = ctx.enter("trial-a");
        let recorded = coordinator
            .intercept_call(&scope, "gpt-4", None, input, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"completion": "should not run"}))
            })
            .await
            .unwrap();

        // Cache hit from the root run, but the subrun keeps its own node
        // sequence starting at one.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(recorded.node_id, NodeId(1));
        assert_eq!(recorded.output.to_json(), json!({"completion": "answered once"}));
    }

    #[tokio::test]
    async fn test_concurrent_subruns_from_forked_contexts() {
        let (coordinator, _rx) = create_coordinator().await;
        let ctx = coordinator.start_session(None).await;
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for name in ["trial-a", "trial-b"] {
            let coordinator = Arc::clone(&coordinator);
            let mut forked = ctx.fork();
            handles.push(tokio::spawn(async move {
                let scope = forked.enter(name);
                let recorded = coordinator
                    .intercept_call(
                        &scope,
                        "gpt-4",
                        None,
                        json!({"prompt": format!("work item for {name}")}),
                        |_| async { Ok(json!({"completion": "done with the work item"})) },
                    )
                    .await
                    .unwrap();
                (scope.effective_id(), recorded.node_id)
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results.sort();

        // Each subrun is its own effective session with its own sequence.
        assert_eq!(results[0].0, format!("{}:trial-a", ctx.root_id()));
        assert_eq!(results[1].0, format!("{}:trial-b", ctx.root_id()));
        assert_eq!(results[0].1, NodeId(1));
        assert_eq!(results[1].1, NodeId(1));
    }
}

#[cfg(test)]
mod degraded_mode_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use async_trait::async_trait;
    use flowtrace::error::{StorageError, StorageResult};
    use flowtrace::storage::{CacheEntry, CallEvent, SessionRecord};

    /// A storage backend whose every operation fails, as when the database
    /// file is unreachable.
    struct UnreachableStorage;

    fn unavailable<T>() -> StorageResult<T> {
        Err(StorageError::Connection {
            message: "database unreachable".to_string(),
        })
    }

    #[async_trait]
    impl Storage for UnreachableStorage {
        async fn create_session(&self, _session: &SessionRecord) -> StorageResult<()> {
            unavailable()
        }
        async fn get_session(&self, _id: &str) -> StorageResult<Option<SessionRecord>> {
            unavailable()
        }
        async fn create_call_event(&self, _event: &CallEvent) -> StorageResult<()> {
            unavailable()
        }
        async fn get_call_event(
            &self,
            _session_id: &str,
            _node_id: NodeId,
        ) -> StorageResult<Option<CallEvent>> {
            unavailable()
        }
        async fn get_session_events(&self, _session_id: &str) -> StorageResult<Vec<CallEvent>> {
            unavailable()
        }
        async fn reserve_cache_entry(
            &self,
            _session_id: &str,
            _fingerprint: &str,
            _input: &serde_json::Value,
        ) -> StorageResult<CacheEntry> {
            unavailable()
        }
        async fn get_cache_entry(
            &self,
            _session_id: &str,
            _fingerprint: &str,
        ) -> StorageResult<Option<CacheEntry>> {
            unavailable()
        }
        async fn fill_cache_output(
            &self,
            _session_id: &str,
            _fingerprint: &str,
            _output: &serde_json::Value,
            _executed_fingerprint: &str,
        ) -> StorageResult<()> {
            unavailable()
        }
        async fn set_input_override(
            &self,
            _session_id: &str,
            _fingerprint: &str,
            _input: &serde_json::Value,
        ) -> StorageResult<()> {
            unavailable()
        }
        async fn set_output_override(
            &self,
            _session_id: &str,
            _fingerprint: &str,
            _output: &serde_json::Value,
        ) -> StorageResult<()> {
            unavailable()
        }
    }

    #[tokio::test]
    async fn test_calls_proceed_uncached_when_storage_is_down() {
        let (events, mut rx) = event_channel();
        let coordinator =
            SessionCoordinator::new(Config::default(), Arc::new(UnreachableStorage), events);
        let ctx = coordinator.start_session(None).await;
        let calls = AtomicUsize::new(0);
        let input = json!({"prompt": "a prompt while the database is down"});

        for _ in 0..2 {
            let recorded = coordinator
                .intercept_call(&ctx, "gpt-4", None, input.clone(), |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"completion": "still answered live"}))
                })
                .await
                .unwrap();
            assert!(recorded.node_id.0 >= 1);
        }

        // No cache without storage: both calls ran for real.
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Degraded mode is reported to the transport once, not per call.
        let degraded = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, GraphEvent::DegradedMode { .. }))
            .count();
        assert_eq!(degraded, 1);
    }
}
