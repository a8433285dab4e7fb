//! 订单事件信封（线上格式）
//!
//! 以 JSON（camelCase）承载：事件 ID、订单 ID、事件类型标签、
//! 可空的完整载荷、时间戳与可读消息。发布边界序列化，之后不再修改。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::EventType;
use crate::error::{BrokerError, BrokerResult};

/// 消息内容类型
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    /// 事件唯一标识符（同时作为 AMQP message_id）
    #[builder(default = Uuid::new_v4())]
    event_id: Uuid,
    /// 订单 ID
    #[builder(into)]
    order_id: String,
    /// 事件类型标签，例如 `order.created`
    #[builder(into)]
    event_type: String,
    /// 事件载荷
    payload: Option<Value>,
    /// 事件创建时间
    #[builder(default = Utc::now())]
    timestamp: DateTime<Utc>,
    /// 可读消息
    #[builder(into, default = String::new())]
    message: String,
}

impl OrderEvent {
    /// 以固定类型与任意可序列化载荷创建事件
    pub fn new<P: Serialize>(
        order_id: impl Into<String>,
        event_type: EventType,
        payload: &P,
        message: impl Into<String>,
    ) -> BrokerResult<Self> {
        // null 与缺省在线上格式中无法区分，统一为 None
        let payload = Some(serde_json::to_value(payload)?).filter(|v| !v.is_null());

        Ok(Self::builder()
            .order_id(order_id)
            .event_type(event_type.routing_key())
            .maybe_payload(payload)
            .message(message)
            .build())
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// 若标签属于已知类型则返回对应枚举
    pub fn known_type(&self) -> Option<EventType> {
        self.event_type.parse().ok()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// 将载荷还原为具体类型
    pub fn payload_as<T: DeserializeOwned>(&self) -> BrokerResult<Option<T>> {
        self.payload
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| BrokerError::Deserialization {
                reason: e.to_string(),
            })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 序列化为线上字节
    pub fn encode(&self) -> BrokerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从线上字节反序列化；失败统一为 `Deserialization`
    pub fn decode(bytes: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Deserialization {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Created {
        amount: u64,
        customer: String,
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let ev = OrderEvent::new(
            "42",
            EventType::OrderCreated,
            &Created {
                amount: 1999,
                customer: "alice".into(),
            },
            "Order 42 created",
        )
        .unwrap();

        let v: Value = serde_json::from_slice(&ev.encode().unwrap()).unwrap();
        assert_eq!(v["orderId"], json!("42"));
        assert_eq!(v["eventType"], json!("order.created"));
        assert_eq!(v["payload"]["amount"], json!(1999));
        assert_eq!(v["message"], json!("Order 42 created"));
        assert!(v["eventId"].is_string());
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn unit_payload_survives_decode() {
        let ev = OrderEvent::new("1", EventType::OrderCreated, &(), "").unwrap();
        assert!(ev.payload().is_none());
        assert_eq!(OrderEvent::decode(&ev.encode().unwrap()).unwrap(), ev);
    }

    #[test]
    fn decode_reproduces_event() {
        let ev = OrderEvent::builder()
            .order_id("7")
            .event_type(EventType::OrderShipped.routing_key())
            .message("shipped")
            .build();
        let bytes = ev.encode().unwrap();
        let back = OrderEvent::decode(&bytes).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.encode().unwrap(), bytes);
        assert_eq!(back.known_type(), Some(EventType::OrderShipped));
        assert!(back.payload().is_none());
    }

    #[test]
    fn typed_payload_access() {
        let ev = OrderEvent::new(
            "1",
            EventType::OrderCreated,
            &Created {
                amount: 5,
                customer: "bob".into(),
            },
            "",
        )
        .unwrap();
        let created: Created = ev.payload_as().unwrap().unwrap();
        assert_eq!(created.customer, "bob");
    }

    #[test]
    fn malformed_bytes_are_deserialization_errors() {
        let err = OrderEvent::decode(b"not json").unwrap_err();
        assert!(matches!(err, BrokerError::Deserialization { .. }));
    }
}
