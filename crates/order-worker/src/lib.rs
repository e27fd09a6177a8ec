//! 逾期订单 worker
//!
//! 两条独立的流水线共用一个进程：
//! - 按发送时间策略分区的合并信号唤醒发布 worker，认领到期订单并发布到逾期订单 topic
//! - `OrderConsumer` 消费该 topic，把订单交给订单处理协作方

pub mod consumer;
pub mod error;
pub mod past_due;
pub mod processor;
pub mod repository;
