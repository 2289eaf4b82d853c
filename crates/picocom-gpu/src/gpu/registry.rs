//! Command dispatch table.
//!
//! Built-in commands are tagged by [`CmdId`]. Extension commands are
//! closures registered by the host for ids `64..128`, either directly or by
//! binding a catalogued extension through the wire `RegisterCmd` command.
//! Uploaded buffer contents are only ever used as a catalogue key.

use std::collections::HashMap;
use std::sync::Arc;

use super::CommandContext;
use crate::error::{ExtensionError, GpuFault};
use crate::protocol::{CmdId, MAX_CMD_ID, USER_CMD_BASE};

/// Extension command handler.
pub type ExtensionFn = Arc<dyn Fn(&mut CommandContext<'_, '_>) -> Result<(), GpuFault> + Send + Sync>;

/// Dry-run check over a full encoded command.
pub type ValidatorFn = Arc<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Builtin(CmdId),
    Extension(ExtensionFn),
}

#[derive(Clone)]
pub struct CommandEntry {
    pub name: String,
    pub handler: Handler,
    pub validator: Option<ValidatorFn>,
}

/// A host-provided extension that the wire protocol can bind by key.
#[derive(Clone)]
pub struct Extension {
    pub name: String,
    pub handler: ExtensionFn,
    pub validator: Option<ValidatorFn>,
}

impl Extension {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut CommandContext<'_, '_>) -> Result<(), GpuFault> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            validator: None,
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&[u8]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn entry(&self) -> CommandEntry {
        CommandEntry {
            name: self.name.clone(),
            handler: Handler::Extension(self.handler.clone()),
            validator: self.validator.clone(),
        }
    }
}

pub struct CommandTable {
    entries: Vec<Option<CommandEntry>>,
    catalogue: HashMap<u16, Extension>,
}

impl core::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bound: Vec<(usize, &str)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e.name.as_str())))
            .collect();
        f.debug_struct("CommandTable")
            .field("entries", &bound)
            .field("catalogue", &self.catalogue.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CommandTable {
    pub fn with_builtins() -> Self {
        let mut table = Self {
            entries: vec![None; MAX_CMD_ID],
            catalogue: HashMap::new(),
        };
        table.reset_to_builtins();
        table
    }

    /// Drop every extension binding. The catalogue is kept.
    pub fn reset_to_builtins(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        for id in CmdId::ALL {
            self.entries[id as usize] = Some(CommandEntry {
                name: id.name().to_string(),
                handler: Handler::Builtin(id),
                validator: None,
            });
        }
    }

    pub fn entry(&self, id: u8) -> Option<CommandEntry> {
        self.entries.get(id as usize).cloned().flatten()
    }

    pub fn name(&self, id: u8) -> Option<String> {
        self.entries.get(id as usize)?.as_ref().map(|e| e.name.clone())
    }

    fn check_user_id(id: u8) -> Result<usize, ExtensionError> {
        if id < USER_CMD_BASE {
            return Err(ExtensionError::ReservedId(id));
        }
        if id as usize >= MAX_CMD_ID {
            return Err(ExtensionError::OutOfRange(id));
        }
        Ok(id as usize)
    }

    /// Bind an extension directly to a user command id.
    pub fn register(&mut self, id: u8, extension: Extension) -> Result<(), ExtensionError> {
        let index = Self::check_user_id(id)?;
        log::info!("command {} bound to extension '{}'", id, extension.name);
        self.entries[index] = Some(extension.entry());
        Ok(())
    }

    /// Make an extension available to `RegisterCmd` under `key`.
    pub fn catalogue(&mut self, key: u16, extension: Extension) {
        self.catalogue.insert(key, extension);
    }

    /// Bind the extension catalogued under `key` to `id`.
    pub fn bind_catalogued(&mut self, id: u8, key: u16) -> Result<(), ExtensionError> {
        let extension = self
            .catalogue
            .get(&key)
            .cloned()
            .ok_or(ExtensionError::UnknownExtension(key))?;
        self.register(id, extension)
    }
}
