pub mod codec;
pub mod connection;
pub mod decoder;
pub mod relation;
pub mod types;



#[cfg(test)]
pub mod test_utils;

pub use codec::PgValue;
pub use connection::{PgReplicationConn, ReplicationConn, ServerMessage};
pub use decoder::{Column, OldTupleKind, PgOutputMessage, Relation, TupleCell, TupleData};
pub use relation::RelationSet;
pub use types::*;
