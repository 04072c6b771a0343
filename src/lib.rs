//! # hivesearch
//!
//! **A self-hosted enterprise knowledge search backend.**
//!
//! hivesearch continuously crawls a pluggable set of content platforms
//! (wikis, chat, ticket trackers, document stores), normalizes their
//! records into one document model, and serves semantic + lexical search
//! over the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌────────┐    ┌─────────┐    ┌───────────────┐
//! │ Connectors │───▶│ TaskQ  │───▶│ Workers │───▶│    IndexQ      │
//! └────────────┘    └────────┘    └─────────┘    └──────┬────────┘
//!       ▲                                               ▼
//!  ┌────┴──────┐                               ┌────────────────┐
//!  │ Scheduler │                               │    Indexer      │
//!  └───────────┘                               │ SQLite+BM25+Vec │
//!                                              └────────┬───────┘
//!                                                       ▼
//!                        ┌──────────┐    ┌──────────────────────┐
//!                        │   HTTP   │───▶│    Query pipeline     │
//!                        └──────────┘    │ recall ▸ rerank ▸ QA │
//!                                        └──────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **scheduler** ([`scheduler`]) wakes stale sources; each
//!    connector seeds crawl tasks onto the durable **task queue**
//!    ([`queue`]).
//! 2. The **worker pool** ([`worker`]) executes crawl steps by dispatching
//!    method names against connector instances ([`connector`]); steps fan
//!    out further tasks and emit normalized [`models::DocumentRecord`]s
//!    onto the **index queue**.
//! 3. The **indexer** ([`indexer`]) drains document batches, splits text
//!    into chunks ([`chunker`]), persists to the **store** ([`store`]), and
//!    refreshes the **lexical** ([`lexical`]) and **vector** ([`vector`])
//!    indexes.
//! 4. The **query pipeline** ([`search`]) recalls candidates from both
//!    indexes, runs the cross-encoder cascade and extractive QA through
//!    the model seams ([`ml`]), and assembles wire-format results.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Application root owning every component |
//! | [`config`] | TOML configuration with defaults |
//! | [`models`] | Canonical document model and task payloads |
//! | [`error`] | Connector-facing error taxonomy |
//! | [`store`] | SQLite store: sources, documents, chunks, cascades |
//! | [`queue`] | Durable at-least-once ack queues |
//! | [`connector`] | Adapter contract and source context |
//! | [`registry`] | Source registry and lifecycle |
//! | [`connector_dir`] | Local folder connector |
//! | [`connector_wiki`] | Wiki connectors (self-hosted and cloud) |
//! | [`ratelimit`] | Per-source token bucket |
//! | [`worker`] | Crawl worker pool |
//! | [`chunker`] | Paragraph-boundary splitter |
//! | [`lexical`] | BM25 index |
//! | [`vector`] | Dense inner-product index |
//! | [`ml`] | Model seams + HTTP inference client |
//! | [`indexer`] | Background indexing loop |
//! | [`search`] | Multi-stage query pipeline |
//! | [`scheduler`] | Periodic re-index ticker |
//! | [`telemetry`] | Install id and counters |
//! | [`server`] | HTTP API (Axum) |

pub mod app;
pub mod chunker;
pub mod config;
pub mod connector;
pub mod connector_dir;
pub mod connector_wiki;
pub mod error;
pub mod indexer;
pub mod lexical;
pub mod ml;
pub mod models;
pub mod queue;
pub mod ratelimit;
pub mod registry;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod vector;
pub mod worker;
