//! Module to setup the API server's global runtime context.
//!
//! Make sure to call `init` *once* when starting up the API server.

use anyhow::Error;

use crate::{connection, tenant};

/// Dependency-inject production client factory and tenant resolution
fn default_setup() {
    connection::init(Box::new(connection::DefaultClientFactory));
    tenant::init(Box::new(tenant::DefaultTenantFactory));
}

/// Dependency-inject concrete implementations needed at runtime.
pub fn init() -> Result<(), Error> {
    default_setup();

    Ok(())
}
