//! Record and job id generation.

use uuid::Uuid;

/// Source of globally unique ids, used as primary keys and job tokens.
pub trait IdGenerator: Send + Sync {
  fn new_id(&self) -> String;
}

/// Random (v4) UUIDs in their hyphenated form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
  fn new_id(&self) -> String {
    Uuid::new_v4().to_string()
  }
}
