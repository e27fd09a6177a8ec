//! 启动时的 topic 补齐
//!
//! 查询当前集群元数据，对配置中存在但集群缺失的 topic（大小写不敏感比较）
//! 按环境规格创建：本地 1 分区 1 副本；云环境 6 分区 3 副本并附加 retention 设置。

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use tracing::info;

use super::{ClientRole, client_config};
use crate::config::{BrokerSecurity, KafkaConfig};
use crate::error::{NotifyError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 待创建 topic 的规格
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: Option<i64>,
}

impl TopicSpec {
    /// 根据安全模式决定分区与副本数
    pub fn for_security(name: &str, security: &BrokerSecurity, retention_ms: Option<i64>) -> Self {
        match security {
            BrokerSecurity::Plaintext => Self {
                name: name.to_string(),
                partitions: 1,
                replication_factor: 1,
                retention_ms: None,
            },
            BrokerSecurity::SaslSsl { .. } => Self {
                name: name.to_string(),
                partitions: 6,
                replication_factor: 3,
                retention_ms,
            },
        }
    }
}

/// topic 管理接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// 集群中已存在的 topic 名称
    async fn existing_topics(&self) -> Result<Vec<String>>;

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()>;
}

/// 确保配置中的全部 topic 存在，返回本次新建的 topic
///
/// 元数据查询按重试策略重试（broker 可能尚未就绪）；创建失败直接返回错误。
pub async fn ensure_topics(
    admin: &dyn TopicAdmin,
    config: &KafkaConfig,
    retry: &RetryPolicy,
) -> Result<Vec<String>> {
    let existing = retry_with_policy(retry, "fetch_topic_metadata", NotifyError::is_retryable, || {
        admin.existing_topics()
    })
    .await?;

    let security = config.security();
    let mut created = Vec::new();

    for topic in config.all_topics() {
        if existing.iter().any(|t| t.eq_ignore_ascii_case(&topic)) {
            continue;
        }

        let spec = TopicSpec::for_security(&topic, &security, config.topic_retention_ms);
        admin.create_topic(&spec).await?;

        info!(
            topic = %spec.name,
            partitions = spec.partitions,
            replication_factor = spec.replication_factor,
            retention_ms = ?spec.retention_ms,
            "已创建 topic"
        );
        created.push(topic);
    }

    Ok(created)
}

// ---------------------------------------------------------------------------
// RdKafkaAdmin
// ---------------------------------------------------------------------------

/// 基于 rdkafka `AdminClient` 的实现
pub struct RdKafkaAdmin {
    admin: AdminClient<DefaultClientContext>,
    metadata_timeout: Duration,
}

impl RdKafkaAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin: AdminClient<DefaultClientContext> = client_config(config, ClientRole::Admin)
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建 admin 客户端失败: {e}")))?;

        Ok(Self {
            admin,
            metadata_timeout: Duration::from_millis(config.metadata_timeout_ms),
        })
    }
}

#[async_trait]
impl TopicAdmin for RdKafkaAdmin {
    async fn existing_topics(&self) -> Result<Vec<String>> {
        // 元数据请求是阻塞调用，只在启动阶段执行一次
        let metadata = self
            .admin
            .inner()
            .fetch_metadata(None, self.metadata_timeout)
            .map_err(|e| NotifyError::Kafka(format!("获取集群元数据失败: {e}")))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<()> {
        let retention = spec.retention_ms.map(|ms| ms.to_string());
        let mut new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        if let Some(retention) = retention.as_deref() {
            new_topic = new_topic.set("retention.ms", retention);
        }

        let results = self
            .admin
            .create_topics([&new_topic], &AdminOptions::new())
            .await
            .map_err(|e| NotifyError::TopicProvisioning {
                topic: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(_) => {}
                // 其他实例抢先创建，视为成功
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    info!(topic = %name, "topic 已由其他实例创建");
                }
                Err((name, code)) => {
                    return Err(NotifyError::TopicProvisioning {
                        topic: name,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
