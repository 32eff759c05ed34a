//! Verify descriptor builders, the classifier and the change-feed decoder
//! against JSON test vectors stored in `test-vectors/`.
//!
//! The same vectors are meant for foreign hosts driving the FFI crate, so
//! they describe requests and responses in plain JSON. Bodies that are JSON
//! are compared as parsed values to avoid false negatives from field order.

use couch_core::{
    classify, ClientConfig, CouchClient, Descriptor, FeedDecoder, FeedEvent, HttpMethod, HttpResponse, Operation,
    OutcomeStatus, ReplicationOptions, ServerIdentity, Subscription, TransportError,
};
use serde_json::Value;

fn str_arg<'a>(args: &'a Value, key: &str) -> &'a str {
    args[key].as_str().unwrap_or_else(|| panic!("missing string arg {key}"))
}

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        "HEAD" => HttpMethod::Head,
        other => panic!("unknown method: {other}"),
    }
}

fn remote_server(spec: &Value) -> ServerIdentity {
    let port = spec["port"].as_u64().unwrap() as u16;
    let mut server = ServerIdentity::new(spec["host"].as_str().unwrap(), port)
        .with_secure(spec["secure"].as_bool().unwrap_or(false));
    if let (Some(user), Some(pass)) = (spec["username"].as_str(), spec["password"].as_str()) {
        server.set_credential(user, pass);
    }
    server
}

fn build(client: &CouchClient, operation: &str, args: &Value) -> Descriptor {
    match operation {
        "check_installation" => client.build_check_installation(),
        "start_session" => client.build_start_session(str_arg(args, "username"), str_arg(args, "password")),
        "end_session" => client.build_end_session(),
        "list_databases" => client.build_list_databases(),
        "create_database" => client.build_create_database(str_arg(args, "database")),
        "delete_database" => client.build_delete_database(str_arg(args, "database")),
        "list_documents" => client.build_list_documents(str_arg(args, "database")),
        "get_revision" => client.build_get_revision(str_arg(args, "database"), str_arg(args, "document_id")),
        "get_document" => client.build_get_document(str_arg(args, "database"), str_arg(args, "document_id")),
        "put_document" => client.build_put_document(
            str_arg(args, "database"),
            str_arg(args, "document_id"),
            str_arg(args, "document").as_bytes().to_vec(),
        ),
        "delete_document" => client.build_delete_document(
            str_arg(args, "database"),
            str_arg(args, "document_id"),
            str_arg(args, "revision"),
        ),
        "put_attachment" => client.build_put_attachment(
            str_arg(args, "database"),
            str_arg(args, "document_id"),
            str_arg(args, "attachment_name"),
            str_arg(args, "attachment").as_bytes().to_vec(),
            str_arg(args, "mime_type"),
            str_arg(args, "revision"),
        ),
        "delete_attachment" => client.build_delete_attachment(
            str_arg(args, "database"),
            str_arg(args, "document_id"),
            str_arg(args, "attachment_name"),
            str_arg(args, "revision"),
        ),
        "replicate" => {
            let remote = remote_server(&args["remote"]);
            let options = ReplicationOptions {
                create_target: args["create_target"].as_bool().unwrap(),
                continuous: args["continuous"].as_bool().unwrap(),
                cancel: args["cancel"].as_bool().unwrap(),
            };
            let source = str_arg(args, "source_database");
            let target = str_arg(args, "target_database");
            match str_arg(args, "direction") {
                "from" => client.build_replicate_from(&remote, source, target, options),
                "to" => client.build_replicate_to(&remote, source, target, options),
                other => panic!("unknown direction {other}"),
            }
            .unwrap()
        }
        other => panic!("unknown operation: {other}"),
    }
}

fn headers(value: &Value) -> Vec<(String, String)> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|h| {
            let pair = h.as_array().unwrap();
            (pair[0].as_str().unwrap().to_string(), pair[1].as_str().unwrap().to_string())
        })
        .collect()
}

#[test]
fn descriptor_vectors() {
    let raw = include_str!("../../test-vectors/descriptors.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    let server = &vectors["server"];
    let server = ServerIdentity::new(server["host"].as_str().unwrap(), server["port"].as_u64().unwrap() as u16);
    let base_url = server.base_url();
    let client = CouchClient::new(server);

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let operation = case["operation"].as_str().unwrap();
        let expected = &case["expected"];

        let d = build(&client, operation, &case["args"]);
        assert_eq!(d.operation(), Operation::from_name(operation).unwrap(), "{name}: operation");
        assert_eq!(d.method(), parse_method(expected["method"].as_str().unwrap()), "{name}: method");
        assert_eq!(d.url(), format!("{base_url}{}", expected["url"].as_str().unwrap()), "{name}: url");
        assert_eq!(d.headers(), headers(&expected["headers"]).as_slice(), "{name}: headers");

        match &expected["body"] {
            Value::Null => assert!(d.body().is_none(), "{name}: body"),
            Value::String(text) => assert_eq!(d.body(), Some(text.as_bytes()), "{name}: body"),
            json => {
                let body: Value = serde_json::from_slice(d.body().unwrap()).unwrap();
                assert_eq!(&body, json, "{name}: body");
            }
        }
    }
}

#[test]
fn credential_header_is_added_to_every_descriptor() {
    let raw = include_str!("../../test-vectors/descriptors.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();
    let client = CouchClient::new(ServerIdentity::default().with_credential("admin", "secret"));

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let d = build(&client, case["operation"].as_str().unwrap(), &case["args"]);
        assert_eq!(d.header("authorization"), Some("Basic YWRtaW46c2VjcmV0"), "{name}");
    }
}

#[test]
fn classify_vectors() {
    let raw = include_str!("../../test-vectors/classify.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let operation = Operation::from_name(case["operation"].as_str().unwrap()).unwrap();

        let result = match case["transport_error"].as_str() {
            Some(message) => Err(TransportError::new(message)),
            None => {
                let resp = &case["response"];
                let mut response = HttpResponse::new(
                    resp["status"].as_u64().unwrap() as u16,
                    resp["body"].as_str().unwrap().as_bytes().to_vec(),
                );
                for (k, v) in headers(&resp["headers"]) {
                    response = response.with_header(&k, v);
                }
                Ok(response)
            }
        };

        let outcome = classify(operation, result);
        let expected = &case["expected"];
        let status: OutcomeStatus = serde_json::from_value(expected["status"].clone()).unwrap();
        assert_eq!(outcome.status, status, "{name}: status");
        assert_eq!(outcome.revision.as_deref(), expected["revision"].as_str(), "{name}: revision");
        assert_eq!(outcome.operation, operation, "{name}: operation");
        if case["transport_error"].is_string() {
            assert!(outcome.data.is_empty(), "{name}: data");
        }
    }
}

fn expected_event(value: &Value) -> FeedEvent {
    if let Some(changed) = value.get("changed") {
        FeedEvent::Changed {
            document_id: changed["document_id"].as_str().unwrap().to_string(),
            revision: changed["revision"].as_str().unwrap().to_string(),
        }
    } else {
        let failed = &value["failed"];
        FeedEvent::Failed {
            document_id: failed["document_id"].as_str().map(str::to_string),
            error: failed["error"].as_str().unwrap().to_string(),
            reason: failed["reason"].as_str().map(str::to_string),
        }
    }
}

#[test]
fn change_feed_vectors() {
    let raw = include_str!("../../test-vectors/changes.json");
    let vectors: Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let mut subscription = Subscription::new(
            case["database"].as_str().unwrap(),
            case["document_id"].as_str(),
            &ClientConfig::default(),
        );
        let mut decoder = FeedDecoder::new();

        let mut events = Vec::new();
        for chunk in case["chunks"].as_array().unwrap() {
            for line in decoder.push(chunk.as_str().unwrap().as_bytes()) {
                events.extend(subscription.apply(&line));
            }
        }
        if let Some(rest) = decoder.finish() {
            events.extend(subscription.apply(&rest));
        }

        let expected: Vec<FeedEvent> = case["expected_events"]
            .as_array()
            .unwrap()
            .iter()
            .map(expected_event)
            .collect();
        assert_eq!(events, expected, "{name}");
    }
}
