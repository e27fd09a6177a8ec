//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的抽象：
//! - [`ReliableProducer`]：幂等发布，返回布尔/失败集合而不是抛出 broker 异常
//! - [`ensure_topics`]：启动时按环境规格补齐缺失的 topic
//! - [`MessageSource`]：至少一次语义的消费来源
//!
//! admin、producer、consumer 三种客户端共享同一份安全配置。

mod admin;
mod producer;
mod source;

use std::collections::HashMap;

use rdkafka::config::ClientConfig;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use serde::de::DeserializeOwned;

use crate::config::{BrokerSecurity, KafkaConfig};
use crate::error::{NotifyError, Result};

pub use admin::{RdKafkaAdmin, TopicAdmin, TopicSpec, ensure_topics};
pub use producer::{BrokerTransport, PublishOutcome, RdKafkaTransport, ReliableProducer};
pub use source::{MessageSource, RdKafkaSource};

// ---------------------------------------------------------------------------
// 客户端配置
// ---------------------------------------------------------------------------

/// 逻辑客户端角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Admin,
    Producer,
    Consumer,
}

/// 构造指定角色的客户端配置
///
/// 安全模式由 [`KafkaConfig::security`] 推导一次，三种角色使用相同的机制。
pub fn client_config(config: &KafkaConfig, role: ClientRole) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);

    match config.security() {
        BrokerSecurity::Plaintext => {
            client.set("security.protocol", "plaintext");
        }
        BrokerSecurity::SaslSsl {
            mechanism,
            username,
            password,
        } => {
            client
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
    }

    match role {
        ClientRole::Admin => {}
        ClientRole::Producer => {
            client
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set(
                    "message.send.max.retries",
                    config.producer_max_retries.to_string(),
                )
                .set(
                    "retry.backoff.ms",
                    config.producer_retry_backoff_ms.to_string(),
                )
                .set("message.timeout.ms", config.message_timeout_ms.to_string());
        }
        ClientRole::Consumer => {
            // 自动提交只提交显式存储过的 offset：消息交给处理方之后才存储，保证至少一次
            client
                .set("group.id", &config.consumer_group)
                .set("auto.offset.reset", &config.auto_offset_reset)
                .set("enable.auto.commit", "true")
                .set("enable.auto.offset.store", "false");
        }
    }

    client
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    pub(crate) fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| NotifyError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NotificationOrder;

    fn make_message(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "notify.orders.pastdue".to_string(),
            partition: 0,
            offset: 42,
            key: Some("key-1".to_string()),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_plaintext_roles_share_security() {
        let config = KafkaConfig::default();
        for role in [ClientRole::Admin, ClientRole::Producer, ClientRole::Consumer] {
            let client = client_config(&config, role);
            assert_eq!(client.get("security.protocol"), Some("plaintext"));
            assert_eq!(client.get("sasl.username"), None);
            assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
        }
    }

    #[test]
    fn test_sasl_roles_share_security() {
        let config = KafkaConfig {
            sasl_username: "svc".to_string(),
            sasl_password: "secret".to_string(),
            ..Default::default()
        };
        for role in [ClientRole::Admin, ClientRole::Producer, ClientRole::Consumer] {
            let client = client_config(&config, role);
            assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
            assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
            assert_eq!(client.get("sasl.username"), Some("svc"));
            assert_eq!(client.get("sasl.password"), Some("secret"));
        }
    }

    #[test]
    fn test_producer_is_idempotent_with_full_quorum() {
        let client = client_config(&KafkaConfig::default(), ClientRole::Producer);
        assert_eq!(client.get("enable.idempotence"), Some("true"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("message.send.max.retries"), Some("2"));
        assert_eq!(client.get("retry.backoff.ms"), Some("1000"));
        assert_eq!(client.get("group.id"), None);
    }

    #[test]
    fn test_consumer_stores_offsets_manually() {
        let client = client_config(&KafkaConfig::default(), ClientRole::Consumer);
        assert_eq!(client.get("group.id"), Some("notify-orders"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client.get("enable.idempotence"), None);
    }

    #[test]
    fn test_consumer_message_deserialize_order() {
        let raw = br#"{
            "id": "0190d3c4-4c1e-7c1a-9f1e-1b2c3d4e5f60",
            "creator": "ttd",
            "requestedSendTime": "2024-05-01T08:00:00Z",
            "notificationChannel": "Email",
            "created": "2024-05-01T07:00:00Z"
        }"#;
        let msg = make_message(raw);
        let order: NotificationOrder = msg.deserialize_payload().unwrap();
        assert_eq!(order.creator, "ttd");
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = make_message(b"not json");
        let result: Result<serde_json::Value> = msg.deserialize_payload();
        assert!(matches!(result, Err(NotifyError::Serialization(_))));
    }

    #[test]
    fn test_consumer_message_payload_str_invalid_utf8() {
        assert_eq!(make_message(b"hello").payload_str().unwrap(), "hello");
        assert!(make_message(&[0xFF, 0xFE]).payload_str().is_err());
    }
}
