pub mod fanout;

pub use fanout::{GroupDelivery, GroupFanoutEncryptor};
