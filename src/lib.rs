//! # GraphRAG Harness
//!
//! Project-scoped GraphRAG indexing and question answering over a REST API.
//!
//! Each project is an isolated workspace holding input documents, engine
//! settings, credentials, and index artifacts. Projects move through a small
//! lifecycle (`created → indexing → indexed | index_failed`) tracked in a
//! persistent registry; questions are only answered once a project is
//! `indexed`. The graph engine itself (entity extraction, community
//! detection, global/local search) is an external program driven through
//! the [`engine`] traits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ┌──────────┐
//! │   HTTP   │  │   CLI    │
//! │  (axum)  │  │  (grh)   │
//! └────┬─────┘  └────┬─────┘
//!      └──────┬──────┘
//!             ▼
//!     ┌────────────────┐     ┌────────────┐
//!     │ ProjectManager │────▶│  Registry  │──▶ SQLite
//!     └───┬────────┬───┘     └────────────┘
//!         ▼        ▼
//!   ┌─────────┐ ┌──────────┐   ┌──────────────┐
//!   │ Indexer │ │ Dispatch │──▶│ graph engine │
//!   └────┬────┘ └──────────┘   └──────────────┘
//!        ▼
//!   workspace/<id>/{input, settings.yaml, .env, output}
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Domain and engine errors |
//! | [`workspace`] | Per-project directory layout |
//! | [`settings`] | Engine settings and credential files |
//! | [`registry`] | Project status tracking |
//! | [`engine`] | External engine seams and the `graphrag` CLI engine |
//! | [`indexer`] | Indexing runs and concurrency limits |
//! | [`locks`] | Per-project file locks shared across processes |
//! | [`query`] | Query dispatch for indexed projects |
//! | [`lifecycle`] | Create, upload, delete |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod lifecycle;
pub mod locks;
pub mod migrate;
pub mod models;
pub mod query;
pub mod registry;
pub mod server;
pub mod settings;
pub mod workspace;
