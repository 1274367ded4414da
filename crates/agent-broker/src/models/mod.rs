pub mod instance;
pub mod plan;

pub use instance::{deployment_name, Instance, LifecycleState};
pub use plan::{Catalog, Plan};
