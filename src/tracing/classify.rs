//! Lexical protocol and invocation-type classification.
//!
//! The labels are advisory annotations for downstream renderers. Both
//! functions are pure so they can run on the host thread without locking.

use super::types::{InvocationType, Protocol};

/// Substring tables tried top-down; the first matching row wins.
const PROTOCOL_RULES: &[(Protocol, &[&str])] = &[
    (
        Protocol::Sql,
        &[
            "jdbc",
            "datasource",
            "connection",
            "statement",
            "resultset",
            "repository",
            "hibernate",
            "jpa",
            "mybatis",
        ],
    ),
    (
        Protocol::Http,
        &["httpclient", "resttemplate", "webclient", "controller", "servlet", "feign"],
    ),
    (Protocol::Grpc, &["grpc", "protobuf", "stub"]),
    (Protocol::Kafka, &["kafka", "producer", "consumer"]),
    (Protocol::Amqp, &["rabbit", "amqp"]),
    (Protocol::Redis, &["redis", "jedis", "lettuce"]),
    (Protocol::WebSocket, &["websocket", "stomp"]),
    (Protocol::Async, &["completablefuture", "async", "reactive", "flux", "mono"]),
];

/// Method-name substrings that alone mark a protocol.
const HTTP_METHODS: &[&str] = &["doget", "dopost", "dorequest"];

const SQL_VERBS: &[&str] =
    &["select", "insert", "update", "delete", "create", "drop", "alter", "merge", "with"];

/// Classifies the wire protocol a call most likely exercises.
///
/// `argument` is the stringified first argument, used only for SQL-verb
/// sniffing; pass `None` when value capture is off.
pub fn protocol_of(module: &str, function: &str, argument: Option<&str>) -> Option<Protocol> {
    let module = module.to_ascii_lowercase();
    let function = function.to_ascii_lowercase();

    for (protocol, needles) in PROTOCOL_RULES {
        if needles.iter().any(|n| module.contains(n) || function.contains(n)) {
            return Some(*protocol);
        }
        match protocol {
            Protocol::Sql => {
                if let Some(arg) = argument {
                    let arg = arg.trim_start().to_ascii_lowercase();
                    if SQL_VERBS.iter().any(|verb| arg.starts_with(verb)) {
                        return Some(Protocol::Sql);
                    }
                }
            }
            Protocol::Http => {
                if HTTP_METHODS.iter().any(|n| function.contains(n)) {
                    return Some(Protocol::Http);
                }
            }
            Protocol::Async => {
                if function.contains("subscribe") {
                    return Some(Protocol::Async);
                }
            }
            _ => {}
        }
    }
    None
}

/// Classifies how a call entered the program.
pub fn invocation_type_of(module: &str, function: &str) -> InvocationType {
    let module = module.to_ascii_lowercase();
    let function = function.to_ascii_lowercase();

    if ["controller", "resource", "endpoint"].iter().any(|n| module.contains(n)) {
        return InvocationType::ApiEntry;
    }
    if ["on", "handle", "process", "listener"].iter().any(|n| function.starts_with(n))
        || function.contains("listener")
    {
        return InvocationType::EventHandler;
    }
    if ["scheduled", "cron", "timer"].iter().any(|n| module.contains(n) || function.contains(n)) {
        return InvocationType::Scheduled;
    }
    if ["callback", "complete", "accept", "apply"].iter().any(|n| function.contains(n)) {
        return InvocationType::Callback;
    }
    InvocationType::Internal
}
