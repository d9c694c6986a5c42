//! Controllers keyed by pool name
//!
//! The application owns the registry and passes controllers to route registration, so
//! repeated setup for the same pool shares one controller without any global state.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::config::TxConfig;
use crate::controller::Controller;
use crate::pool::TransactionalPool;

pub struct Registry<P: TransactionalPool> {
    config: TxConfig,
    controllers: Mutex<HashMap<String, Controller<P>>>,
}

impl<P: TransactionalPool> Registry<P> {
    pub fn new(config: TxConfig) -> Self {
        Self {
            config,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// The controller registered under `key`, attaching `pool` if it has none yet
    pub fn get_or_create(&self, key: &str, pool: P) -> Controller<P> {
        let controller = self.controller(key);
        if controller.pool().is_none() {
            // Lost a race with another attach; the existing pool stays.
            let _ = controller.attach(pool);
        }
        controller
    }

    /// The controller registered under `key`, created without a pool if absent.
    /// Its `begin` stage reports `UndefinedPool` until a pool is attached.
    pub fn controller(&self, key: &str) -> Controller<P> {
        self.controllers
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Controller::detached(self.config.clone()))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Controller<P>> {
        self.controllers.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}

impl<P: TransactionalPool> Default for Registry<P> {
    fn default() -> Self {
        Self::new(TxConfig::default())
    }
}
