//! Multi-operation tests: fan-out, quiet mode, timeouts

mod common;

#[cfg(test)]
mod tests {
    use super::common::{ScriptedTransport, doc, not_found};
    use bytes::Bytes;
    use docbridge_sdk::{
        BridgeError, Client, ClientConfig, Command, Entry, ErrorCode, LoopbackTransport,
        MultiOptions, submit_batch, wait_batch,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn loopback_client() -> Client {
        let transport = Arc::new(LoopbackTransport::new().unwrap());
        Client::new(transport, ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_all_completions_collected_regardless_of_order() {
        let transport = ScriptedTransport::new();
        let commands = (0..5).map(|i| Command::get(format!("k{}", i))).collect();
        let handle = submit_batch(transport.as_ref(), commands, false);
        assert_eq!(handle.submitted(), 5);
        assert_eq!(handle.remaining(), 5);

        let completer = transport.complete_in_order(vec![
            ("k4", doc("4")),
            ("k0", doc("0")),
            ("k2", doc("2")),
            ("k3", doc("3")),
            ("k1", doc("1")),
        ]);
        let result = wait_batch(&handle, Duration::from_secs(5), false).unwrap();
        completer.join().unwrap();

        assert_eq!(result.len(), 5);
        assert!(result.all_ok());
        assert!(!result.is_partial());
        for i in 0..5 {
            let entry = result.get(&format!("k{}", i)).unwrap();
            let expected = Bytes::from(i.to_string());
            assert_eq!(entry.value().unwrap().value(), Some(&expected));
        }
        assert!(handle.is_complete());
    }

    #[test]
    fn test_quiet_multi_get_with_missing_key() {
        let client = loopback_client();
        client.upsert("A", "a").unwrap();
        client.upsert("C", "c").unwrap();

        let result = client
            .get_multi(["A", "B", "C"], MultiOptions::quiet())
            .unwrap();
        assert_eq!(result.len(), 3);
        assert!(result.get("A").unwrap().is_value());
        assert_eq!(result.get("B"), Some(&Entry::NotFound));
        assert!(result.get("C").unwrap().is_value());
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_non_quiet_missing_key_raises() {
        let client = loopback_client();
        client.upsert("A", "a").unwrap();

        let err = client
            .get_multi(["A", "B"], MultiOptions::default())
            .unwrap_err();
        match err {
            BridgeError::PartialBatchFailure { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, "B");
                assert!(failed[0].1.is_not_found());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_quiet_keeps_other_errors_per_key() {
        let client = loopback_client();
        client.upsert("A", "a").unwrap();

        let commands = vec![
            Command::insert("A", "again"),
            Command::insert("B", "b"),
            Command::get("missing"),
        ];
        let result = client.multi_op(commands, MultiOptions::quiet()).unwrap();
        assert_eq!(result.len(), 3);
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "A");
        assert_eq!(errors[0].1.code(), Some(ErrorCode::KeyExists));
        assert_eq!(result.get("missing"), Some(&Entry::NotFound));
    }

    #[test]
    fn test_first_error_leads_aggregate_failure() {
        let transport = ScriptedTransport::new();
        let commands = vec![Command::get("a"), Command::get("b"), Command::get("c")];
        let handle = submit_batch(transport.as_ref(), commands, false);

        let completer = transport.complete_in_order(vec![
            ("c", Err(BridgeError::transport(ErrorCode::TemporaryFailure, "busy"))),
            ("a", Err(BridgeError::transport(ErrorCode::Network, "reset"))),
            ("b", doc("b")),
        ]);
        let err = handle.wait(Duration::from_secs(5), false).unwrap_err();
        completer.join().unwrap();

        match err {
            BridgeError::PartialBatchFailure { failed } => {
                let keys: Vec<&str> = failed.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["c", "a"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_timeout_discards_late_results() {
        let transport = ScriptedTransport::new();
        let handle = submit_batch(
            transport.as_ref(),
            vec![Command::get("a"), Command::get("b")],
            false,
        );
        assert!(transport.complete("a", doc("a")));

        let err = handle.wait(Duration::from_millis(20), false).unwrap_err();
        assert!(err.is_timeout());

        // The late completion is logged and dropped; nothing is delivered
        assert!(transport.complete("b", doc("b")));
        assert!(handle.is_complete());
        assert!(handle.wait(Duration::ZERO, true).is_err());
    }

    #[test]
    fn test_partial_results_are_opt_in() {
        let transport = ScriptedTransport::new();
        let handle = submit_batch(
            transport.as_ref(),
            vec![Command::get("a"), Command::get("b"), Command::get("c")],
            true,
        );
        assert!(transport.complete("a", doc("a")));
        assert!(transport.complete("c", not_found("c")));

        let result = handle.wait(Duration::from_millis(20), true).unwrap();
        assert!(result.is_partial());
        assert_eq!(result.len(), 2);
        assert_eq!(result.pending_keys().to_vec(), vec!["b".to_string()]);
        assert_eq!(result.get("c"), Some(&Entry::NotFound));

        assert!(transport.complete("b", doc("b")));
    }

    #[test]
    fn test_upsert_and_remove_multi() {
        let client = loopback_client();
        let stored = client
            .upsert_multi([("x", "1"), ("y", "2")], MultiOptions::default())
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.all_ok());

        let removed = client
            .remove_multi(["x", "y", "z"], MultiOptions::quiet())
            .unwrap();
        assert_eq!(removed.get("z"), Some(&Entry::NotFound));

        let values = client
            .get_multi(["x"], MultiOptions::quiet())
            .unwrap();
        assert_eq!(values.get("x"), Some(&Entry::NotFound));
    }

    #[test]
    fn test_into_values_skips_missing_entries() {
        let client = loopback_client();
        client.upsert("a", "1").unwrap();
        let result = client.get_multi(["a", "b"], MultiOptions::quiet()).unwrap();
        let values = result.into_values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["a"].value(), Some(&Bytes::from_static(b"1")));

        let result = client
            .multi_op(vec![Command::insert("a", "2")], MultiOptions::quiet())
            .unwrap();
        assert!(result.into_values().is_err());
    }
}
