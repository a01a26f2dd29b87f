//! # Configuration
//!
//! Three configuration surfaces, resolved at different times:
//!
//! - [`AppConfig`] - process-wide settings read from environment variables at
//!   startup (a `.env` file is honored when present)
//! - poll configs - the YAML file referenced by `DOCO_CD_CONFIG_FILE`,
//!   describing repositories to poll on an interval
//! - deploy-configs - YAML files inside each repository (or inline in a poll
//!   config), describing the stacks to reconcile

mod app;
mod deploy;
mod poll;

pub use app::AppConfig;
pub use deploy::{
    load_deploy_configs, AutoDiscoverOpts, BuildOpts, DeployConfig, DestroyOpts,
};
pub use poll::{load_poll_configs, PollConfig};
