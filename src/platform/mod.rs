pub mod cards;
pub mod feishu;
pub mod traits;

pub use feishu::FeishuClient;
pub use traits::{Delivery, MessageBody, MessageTarget, Messenger, SendMessage};
