//! 领域事件（event）
//!
//! 定义固定的事件类型/路由键映射表（`EventType`）与线上事件信封（`OrderEvent`）。

mod event_type;
mod order_event;

pub use event_type::EventType;
pub use order_event::{CONTENT_TYPE, OrderEvent};
