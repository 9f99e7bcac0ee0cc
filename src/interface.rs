// Copyright 2020 Joyent, Inc.

//! Interface definitions shared by proxies and skeletons.
//!
//! An interface is a name and a set of methods with their arity. Proxies use
//! it to reject undeclared calls before any I/O; skeletons use it to check
//! their dispatch tables when they are built.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::Error;

pub const NAMING_INTERFACE: &str = "naming-context";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDef {
    name: String,
    methods: BTreeMap<String, usize>,
}

impl InterfaceDef {
    pub fn new<N: Into<String>>(name: N) -> InterfaceDef {
        InterfaceDef {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method<M: Into<String>>(mut self, name: M, arity: usize) -> InterfaceDef {
        self.methods.insert(name.into(), arity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self, method: &str) -> Option<usize> {
        self.methods.get(method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn check_call(&self, method: &str, argc: usize) -> Result<(), Error> {
        match self.arity(method) {
            Some(arity) if arity == argc => Ok(()),
            Some(arity) => Err(Error::Config(format!(
                "{}.{} takes {} arguments, {} given",
                self.name, method, arity, argc
            ))),
            None => Err(Error::Config(format!(
                "{} declares no method '{}'",
                self.name, method
            ))),
        }
    }
}

/// The interface every naming node answers.
pub fn naming_interface() -> InterfaceDef {
    InterfaceDef::new(NAMING_INTERFACE)
        .method("lookup", 1)
        .method("list", 0)
}

/// Client-side map from interface names, as reported by a peer's
/// `remote-class`/`home-class` attributes, to their definitions.
#[derive(Debug, Default)]
pub struct InterfaceCatalog {
    defs: RwLock<HashMap<String, Arc<InterfaceDef>>>,
}

impl InterfaceCatalog {
    pub fn new() -> InterfaceCatalog {
        let catalog = InterfaceCatalog::default();
        catalog.register(naming_interface());
        catalog
    }

    /// Later registrations of the same name replace earlier ones.
    pub fn register(&self, def: InterfaceDef) -> Arc<InterfaceDef> {
        let def = Arc::new(def);
        if let Ok(mut defs) = self.defs.write() {
            defs.insert(def.name().to_string(), Arc::clone(&def));
        }
        def
    }

    pub fn get(&self, name: &str) -> Result<Arc<InterfaceDef>, Error> {
        self.defs
            .read()
            .ok()
            .and_then(|defs| defs.get(name).cloned())
            .ok_or_else(|| Error::Config(format!("unknown interface '{}'", name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn calls_are_checked_against_declaration() {
        let calc = InterfaceDef::new("calculator").method("add", 2);

        assert!(calc.check_call("add", 2).is_ok());
        assert!(matches!(calc.check_call("add", 1), Err(Error::Config(_))));
        assert!(matches!(calc.check_call("sub", 2), Err(Error::Config(_))));
    }

    #[test]
    fn catalog_knows_naming_interface() {
        let catalog = InterfaceCatalog::new();

        assert_eq!(catalog.get(NAMING_INTERFACE).unwrap().arity("lookup"), Some(1));
        assert!(matches!(catalog.get("calculator"), Err(Error::Config(_))));
        catalog.register(InterfaceDef::new("calculator"));
        assert!(catalog.get("calculator").is_ok());
    }
}
