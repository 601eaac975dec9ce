//! Declarative plugin manager for AI coding agents.
//!
//! A project declares plugins in `dex.toml`; [`plugin::Installer`] resolves
//! them from registries, translates each package into a [`plugin::plan::Plan`]
//! for the project's agent platform and applies it, tracking every written
//! path in `.dex/manifest.json` and every resolved version in `dex.lock`.

pub mod error;
pub mod model;
pub mod plugin;

pub use error::{DexError, Result, Stage};
