//! Local data command handlers

use anyhow::{bail, Result};

use mtrace_core::{EntityType, SyncEngine};

use crate::output::Output;

/// Show a locally stored entity
pub fn get(engine: &SyncEngine, entity: &str, id: &str, output: &Output) -> Result<()> {
    let entity_type: EntityType = entity.parse()?;
    match engine.get(entity_type, id)? {
        Some(value) => {
            output.print_entity(&value);
            Ok(())
        }
        None => bail!("No {} with id '{}' in the local store", entity_type, id),
    }
}
