//! Warren Core: deliveries, text encodings, codecs, and type bindings.

pub mod binding;
pub mod codec;
pub mod delivery;
pub mod encoding;
pub mod error;

pub use binding::{Payload, TypeBinding, TypeBindingRegistry};
pub use codec::{content_types, Codec, CodecRegistry, JsonCodec, MsgPackCodec};
pub use delivery::{ChannelId, Delivery, DeliveryBuilder, DeliveryTag, Properties};
pub use encoding::Encoding;
pub use error::{CodecError, RegistryError};
