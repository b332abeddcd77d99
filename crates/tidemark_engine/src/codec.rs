//! Entity codec capability.

use crate::error::SyncResult;
use tidemark_protocol::{Record, RemoteObject};
use tidemark_store::LocalId;

/// Maps one entity type between its local row and its remote object.
///
/// Every method is pure. The engine never looks inside an entity; it only
/// moves entities between the stores through this trait.
///
/// # Contract
///
/// - [`EntityCodec::to_remote`] carries the entity's remote id exactly when
///   [`EntityCodec::has_remote_id`] holds; the engine creates entities
///   without one and updates the rest
/// - [`EntityCodec::to_record`] writes `modified_at` into the local
///   modification column and the entity's remote id and remote modification
///   time into their columns
/// - [`EntityCodec::from_record`] must recover the local id of a stored row
pub trait EntityCodec: Send + Sync {
    /// The domain entity being synchronized.
    type Entity: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Decodes a downloaded object.
    fn from_remote(&self, object: &RemoteObject) -> SyncResult<Self::Entity>;

    /// Encodes an entity for create or update.
    fn to_remote(&self, entity: &Self::Entity) -> RemoteObject;

    /// Encodes an entity as local row fields stamped with `modified_at`.
    fn to_record(&self, entity: &Self::Entity, modified_at: i64) -> Record;

    /// Decodes a stored row.
    fn from_record(&self, record: &Record) -> SyncResult<Self::Entity>;

    /// Returns the remote id, if the entity has been created remotely.
    fn remote_id<'a>(&self, entity: &'a Self::Entity) -> Option<&'a str>;

    /// Returns the local id, if the entity has been stored locally.
    fn local_id(&self, entity: &Self::Entity) -> Option<LocalId>;

    /// Records the id and modification time the remote store assigned.
    fn set_remote_state(&self, entity: &mut Self::Entity, remote_id: &str, modified_at: i64);

    /// Returns true if the entity has been created remotely.
    fn has_remote_id(&self, entity: &Self::Entity) -> bool {
        self.remote_id(entity).is_some()
    }

    /// Decodes a downloaded object straight into local row fields stamped
    /// with `modified_at`, for callers seeding a table outside a cycle.
    fn to_local_record(&self, object: &RemoteObject, modified_at: i64) -> SyncResult<Record> {
        let entity = self.from_remote(object)?;
        Ok(self.to_record(&entity, modified_at))
    }
}
