//! The DNS wire protocol: message, question, and resource record
//! types (`types`), plus serialisation (`serialise`) and
//! deserialisation (`deserialise`) to and from the wire format
//! described in RFC 1035 section 4.

pub mod deserialise;
pub mod serialise;
pub mod types;

pub use deserialise::Error as DeserialiseError;
pub use serialise::Error as SerialiseError;
pub use types::*;
