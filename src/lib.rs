//! # Dossier Pipeline
//!
//! Multi-stage LLM analysis of long legal-process PDFs.
//!
//! A document is registered, split into page-range chunks when it is too
//! large for one model call, and run through a fixed list of analysis stages.
//! Each stage becomes one unit that is claimed atomically, executed through
//! an ordered list of fallback models (directly, or map-reduce over chunks),
//! checked by a JSON completeness validator, and persisted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐   ┌──────────────┐
//! │  ingest  │──▶│  planner  │──▶│ uploader  │──▶│ queue (c × s)│
//! └──────────┘   └───────────┘   └───────────┘   └──────┬───────┘
//!                                                       │
//!     ┌─────────────────────────────────────────────────┘
//!     ▼
//! ┌────────┐   ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │ claim  │──▶│ executor │──▶│ consolidator │──▶│ validator │──▶ store
//! └────────┘   └──────────┘   └──────────────┘   └───────────┘
//!     ▲                                                │
//!     └──────────── dispatcher re-enqueues ◀───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dossier init
//! dossier ingest ./processo.pdf
//! dossier analyze <id> --wait
//! dossier status <id>
//! dossier serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline errors |
//! | [`store`] | `UnitStore` trait, SQLite and in-memory backends |
//! | [`claim`] | Atomic unit claiming |
//! | [`executor`] | Model fallback executor |
//! | [`planner`] | Chunk planning and PDF splitting |
//! | [`uploader`] | Chunk upload with retries and readiness polling |
//! | [`queue`] | Idempotent (chunk, stage) queue |
//! | [`consolidator`] | Map-reduce over chunks |
//! | [`validator`] | JSON completeness validator |
//! | [`stages`] | Stage kinds and schema registry |
//! | [`driver`] | One-step pipeline driver |
//! | [`dispatcher`] | Worker pool that re-enqueues documents |
//! | [`monitor`] | Stuck-unit detection and alerts |
//! | [`provider`] | LLM provider trait and Gemini client |
//! | [`notify`] | Operator notifications |
//! | [`storage`] | Object storage for originals and chunks |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod claim;
pub mod commands;
pub mod config;
pub mod consolidator;
pub mod db;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod executor;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod pdf;
pub mod planner;
pub mod provider;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod stages;
pub mod storage;
pub mod store;
pub mod uploader;
pub mod validator;
