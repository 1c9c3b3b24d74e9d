//! Streaming request tests

mod common;

#[cfg(test)]
mod tests {
    use super::common::ScriptedTransport;
    use docbridge_sdk::{
        BridgeError, Client, ClientConfig, ErrorCode, LoopbackTransport, Row, StreamRequest,
        StreamState,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn loopback_client() -> Client {
        let transport = Arc::new(LoopbackTransport::new().unwrap());
        let config = ClientConfig::default().with_poll_interval(Duration::from_millis(10));
        Client::new(transport, config).unwrap()
    }

    #[test]
    fn test_query_rows_in_key_order() {
        let client = loopback_client();
        client.upsert("user:2", r#"{"name":"bob"}"#).unwrap();
        client.upsert("user:1", r#"{"name":"alice"}"#).unwrap();
        client.upsert("order:1", "plain text").unwrap();

        let rows = client
            .execute_streaming(StreamRequest::query("user:"), None)
            .unwrap()
            .collect_rows()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                Row::Query(json!({"id": "user:1", "value": {"name": "alice"}})),
                Row::Query(json!({"id": "user:2", "value": {"name": "bob"}})),
            ]
        );
    }

    #[test]
    fn test_view_rows() {
        let client = loopback_client();
        client.upsert("order:1", "plain text").unwrap();

        let mut stream = client
            .execute_streaming(StreamRequest::view("orders", "by_id"), None)
            .unwrap();
        match stream.next_row().unwrap() {
            Some(Row::View(row)) => {
                assert_eq!(row.id.as_deref(), Some("order:1"));
                assert_eq!(row.value, json!("plain text"));
            }
            other => panic!("unexpected row: {:?}", other),
        }
        assert_eq!(stream.next_row().unwrap(), None);
    }

    #[test]
    fn test_drained_stream_stays_ended() {
        let client = loopback_client();
        client.upsert("a", "1").unwrap();

        let mut stream = client
            .execute_streaming(StreamRequest::query("a"), None)
            .unwrap();
        assert!(stream.next_row().unwrap().is_some());
        for _ in 0..3 {
            assert_eq!(stream.next_row().unwrap(), None);
        }
        assert_eq!(stream.state(), StreamState::Complete);
        assert_eq!(stream.rows_yielded(), 1);
    }

    #[test]
    fn test_iterator_adapter() {
        let client = loopback_client();
        for i in 0..10 {
            client.upsert(format!("item:{:02}", i), i.to_string()).unwrap();
        }
        let stream = client
            .execute_streaming(StreamRequest::query("item:"), None)
            .unwrap();
        let ids: Vec<String> = stream
            .map(|row| match row.unwrap() {
                Row::Query(value) => value["id"].as_str().unwrap_or_default().to_string(),
                other => panic!("unexpected row: {:?}", other),
            })
            .collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids[0], "item:00");
        assert_eq!(ids[9], "item:09");
    }

    #[test]
    fn test_cancel_signals_transport_once() {
        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), ClientConfig::default()).unwrap();

        let mut stream = client
            .execute_streaming(StreamRequest::query("x"), None)
            .unwrap();
        let producer = transport.last_producer().unwrap();
        assert!(producer.push(Row::Query(json!(1))));

        stream.cancel();
        stream.cancel();
        assert_eq!(stream.state(), StreamState::Cancelled);
        assert_eq!(stream.next_row().unwrap(), None);
        assert_eq!(transport.stream_cancels(), 1);

        // Rows still in flight are rejected rather than reviving the stream
        assert!(!producer.push(Row::Query(json!(2))));
        producer.finish();
        drop(stream);
        assert_eq!(transport.stream_cancels(), 1);
    }

    #[test]
    fn test_producer_failure_is_terminal() {
        let transport = ScriptedTransport::new();
        let client = Client::new(transport.clone(), ClientConfig::default()).unwrap();
        let mut stream = client
            .execute_streaming(StreamRequest::query("x"), None)
            .unwrap();
        let producer = transport.last_producer().unwrap();

        let feeder = thread::spawn(move || {
            producer.push(Row::Query(json!("first")));
            thread::sleep(Duration::from_millis(20));
            producer.fail(BridgeError::transport(ErrorCode::Network, "connection reset"));
        });

        assert_eq!(stream.next_row().unwrap(), Some(Row::Query(json!("first"))));
        let err = stream.next_row().unwrap_err();
        feeder.join().unwrap();

        assert_eq!(err.code(), Some(ErrorCode::Network));
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(stream.next_row().unwrap_err(), err);

        // A failed stream ends failed, not cancelled, and is not re-cancelled
        stream.cancel();
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(transport.stream_cancels(), 0);
    }

    #[test]
    fn test_stream_deadline() {
        let transport = ScriptedTransport::new();
        let config = ClientConfig::default().with_poll_interval(Duration::from_millis(5));
        let client = Client::new(transport.clone(), config).unwrap();

        let mut stream = client
            .execute_streaming(StreamRequest::query("x"), Some(Duration::from_millis(40)))
            .unwrap();
        let err = stream.next_row().unwrap_err();
        assert_eq!(
            err,
            BridgeError::Timeout {
                waited: Duration::from_millis(40)
            }
        );
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(transport.stream_cancels(), 1);
    }

    #[test]
    fn test_dropping_loopback_stream_early() {
        let client = loopback_client();
        for i in 0..100 {
            client.upsert(format!("k{:03}", i), "x").unwrap();
        }
        let mut stream = client
            .execute_streaming(StreamRequest::query("k"), None)
            .unwrap();
        assert!(stream.next_row().unwrap().is_some());
        drop(stream);

        // The connection stays usable
        assert!(client.get("k000").is_ok());
    }
}
