// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    objdef::{ObjDef, ObjDefBuilder},
    shm::Transport,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// Process-wide table of object definitions.
///
/// Create one registry at start-up and pass it by reference. Definitions are
/// only ever added, so after first use the registry is read-mostly.
/// Concurrent first registration of the same name is resolved by
/// [`Registry::publish`]: exactly one definition wins and the other caller
/// receives [`Error::AlreadyExists`].
pub struct Registry {
    defs: RwLock<HashMap<String, Arc<ObjDef>>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry without a privileged side, every definition is local.
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
            transport: None,
        }
    }

    /// A registry that imports definitions through `transport` when they are
    /// not registered locally.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
            transport: Some(transport),
        }
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    /// Local lookup only.
    pub fn lookup(&self, name: &str) -> Option<Arc<ObjDef>> {
        self.defs.read().get(name).cloned()
    }

    /// Returns the definition `name`, importing it from the privileged side
    /// when it is not known locally.
    pub fn get(&self, name: &str) -> Result<Arc<ObjDef>> {
        if let Some(def) = self.lookup(name) {
            return Ok(def);
        }
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("objdef {name}")))?;
        let root = transport
            .objdef_get(name)?
            .ok_or_else(|| Error::NotFound(format!("objdef {name}")))?;
        let def = Arc::new(ObjDef::import(root, transport.clone())?);
        if def.name() != name {
            return Err(Error::mismatch(format!(
                "imported objdef {} for {name}",
                def.name()
            )));
        }

        let mut defs = self.defs.write();
        let def = defs.entry(name.to_owned()).or_insert(def).clone();
        info!("objdef {name} imported");
        Ok(def)
    }

    /// Starts a local registration. Nothing is visible until
    /// [`Registry::publish`].
    pub fn register(&self, name: &str, size: usize) -> Result<ObjDefBuilder> {
        if self.defs.read().contains_key(name) {
            return Err(Error::AlreadyExists(format!("objdef {name}")));
        }
        Ok(ObjDefBuilder::new(name, size))
    }

    /// Finishes `builder` and makes the definition visible, or discards it.
    pub fn publish(&self, builder: ObjDefBuilder) -> Result<Arc<ObjDef>> {
        let def = Arc::new(builder.finish()?);
        let mut defs = self.defs.write();
        if defs.contains_key(def.name()) {
            return Err(Error::AlreadyExists(format!("objdef {}", def.name())));
        }
        defs.insert(def.name().to_owned(), def.clone());
        debug!("objdef {} published", def.name());
        Ok(def)
    }

    /// Publishes a local definition so other users can import it.
    pub fn share(&self, def: &ObjDef) -> Result<()> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::Unsupported(format!("share {} without transport", def.name())))?;
        if def.is_shared() {
            return Err(Error::state(format!("objdef {} is already shared", def.name())));
        }
        transport.objdef_share(def.name(), def.trie().get_node_root())
    }

    /// One-time initializer for a typed schema: returns the existing or
    /// imported definition, otherwise registers it with `fill`.
    pub fn get_or_register<F>(&self, name: &str, size: usize, fill: F) -> Result<Arc<ObjDef>>
    where
        F: FnOnce(&mut ObjDefBuilder) -> Result<()>,
    {
        match self.get(name) {
            Err(Error::NotFound(_)) => {}
            res => return res,
        }
        let mut builder = ObjDefBuilder::new(name, size);
        fill(&mut builder)?;
        match self.publish(builder) {
            Err(Error::AlreadyExists(_)) => self
                .lookup(name)
                .ok_or_else(|| Error::NotFound(format!("objdef {name}"))),
            res => res,
        }
    }

    /// Returns a definition handle to the registry. When it was the last
    /// handle held outside the registry the cached definition is dropped, so
    /// the next [`Registry::get`] imports or registers it again. Returns
    /// whether the definition was dropped.
    pub fn put(&self, def: Arc<ObjDef>) -> bool {
        let mut defs = self.defs.write();
        let cached = defs.get(def.name()).is_some_and(|d| Arc::ptr_eq(d, &def));
        // the table and `def` are the only holders left
        if cached && Arc::strong_count(&def) == 2 {
            defs.remove(def.name());
            debug!("objdef {} put, dropped", def.name());
            return true;
        }
        debug!(
            "objdef {} put, {} handles left",
            def.name(),
            Arc::strong_count(&def) - 1
        );
        false
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ObjDef>> {
        self.defs.write().remove(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn dump(&self) -> Value {
        let defs = self.defs.read();
        let mut sorted: Vec<&Arc<ObjDef>> = defs.values().collect();
        sorted.sort_by(|a, b| a.name().cmp(b.name()));
        Value::Array(sorted.into_iter().map(|def| def.dump()).collect())
    }
}
