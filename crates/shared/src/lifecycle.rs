//! 处理生命周期映射
//!
//! 将各渠道存储的原始状态码映射到统一的生命周期枚举。三个映射函数互相独立、
//! 大小写不敏感，且只接受已知取值：任何未知或空白输入都立即返回错误，
//! 以便尽早发现存储结果码与代码枚举之间的漂移。不提供默认值兜底。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, Result};

/// 在已知取值中做大小写不敏感查找
fn lookup<T: Copy>(
    raw: &str,
    kind: &'static str,
    all: &[T],
    name: impl Fn(&T) -> &'static str,
) -> Result<T> {
    if raw.trim().is_empty() {
        return Err(NotifyError::BlankLifecycleStatus { kind });
    }

    all.iter()
        .copied()
        .find(|v| name(v).eq_ignore_ascii_case(raw))
        .ok_or_else(|| NotifyError::UnknownLifecycleStatus {
            kind,
            value: raw.to_string(),
        })
}

macro_rules! lifecycle_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// 已知取值全集
            pub const ALL: &'static [$name] = &[$( $name::$variant, )+];

            /// 规范名称（与存储中的结果码一致）
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )+
                }
            }

            /// 大小写不敏感解析，未知或空白输入返回错误
            pub fn parse(raw: &str) -> Result<Self> {
                lookup(raw, $kind, Self::ALL, Self::as_str)
            }
        }

        impl FromStr for $name {
            type Err = NotifyError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NotifyError;

            fn try_from(value: String) -> Result<Self> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

lifecycle_enum! {
    /// 订单级生命周期
    ///
    /// 订单何时进入终态由外部订单处理服务决定，这里只负责识别状态码。
    OrderLifecycle, "订单" {
        Registered => "Registered",
        Processing => "Processing",
        Processed => "Processed",
        Completed => "Completed",
        Cancelled => "Cancelled",
        SendConditionNotMet => "SendConditionNotMet",
    }
}

lifecycle_enum! {
    /// 邮件级生命周期
    EmailLifecycle, "邮件" {
        New => "New",
        Sending => "Sending",
        /// 已被邮件服务受理，尚未确认送达
        Succeeded => "Succeeded",
        Delivered => "Delivered",
        Failed => "Failed",
        FailedBounced => "Failed_Bounced",
        FailedQuarantined => "Failed_Quarantined",
        FailedFilteredSpam => "Failed_FilteredSpam",
        FailedTransientError => "Failed_TransientError",
        FailedInvalidEmailFormat => "Failed_InvalidEmailFormat",
        FailedRecipientReserved => "Failed_RecipientReserved",
        // 拼写与存储中的结果码保持一致
        FailedSupressedRecipient => "Failed_SupressedRecipient",
        FailedRecipientNotIdentified => "Failed_RecipientNotIdentified",
    }
}

lifecycle_enum! {
    /// 短信级生命周期
    SmsLifecycle, "SMS" {
        New => "New",
        Sending => "Sending",
        Accepted => "Accepted",
        Delivered => "Delivered",
        Failed => "Failed",
        FailedDeleted => "Failed_Deleted",
        FailedExpired => "Failed_Expired",
        FailedRejected => "Failed_Rejected",
        FailedUndelivered => "Failed_Undelivered",
        FailedBarredReceiver => "Failed_BarredReceiver",
        FailedInvalidRecipient => "Failed_InvalidRecipient",
        FailedRecipientReserved => "Failed_RecipientReserved",
        FailedRecipientNotIdentified => "Failed_RecipientNotIdentified",
    }
}

/// 映射订单状态
pub fn map_order_status(raw: &str) -> Result<OrderLifecycle> {
    OrderLifecycle::parse(raw)
}

/// 映射邮件状态
pub fn map_email_status(raw: &str) -> Result<EmailLifecycle> {
    EmailLifecycle::parse(raw)
}

/// 映射短信状态
pub fn map_sms_status(raw: &str) -> Result<SmsLifecycle> {
    SmsLifecycle::parse(raw)
}

/// 跨渠道统一的处理生命周期
///
/// 面向外部消费方的导出类型，本仓库内不消费。对外名称带渠道前缀，
/// 如 `Order_Completed`、`Email_Failed_Bounced`、`SMS_Delivered`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingLifecycle {
    Order(OrderLifecycle),
    Email(EmailLifecycle),
    Sms(SmsLifecycle),
}

impl From<OrderLifecycle> for ProcessingLifecycle {
    fn from(value: OrderLifecycle) -> Self {
        Self::Order(value)
    }
}

impl From<EmailLifecycle> for ProcessingLifecycle {
    fn from(value: EmailLifecycle) -> Self {
        Self::Email(value)
    }
}

impl From<SmsLifecycle> for ProcessingLifecycle {
    fn from(value: SmsLifecycle) -> Self {
        Self::Sms(value)
    }
}

impl fmt::Display for ProcessingLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order(v) => write!(f, "Order_{v}"),
            Self::Email(v) => write!(f, "Email_{v}"),
            Self::Sms(v) => write!(f, "SMS_{v}"),
        }
    }
}

impl Serialize for ProcessingLifecycle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
