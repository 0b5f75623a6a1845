//! # feedrag
//!
//! A retrieval-augmented chat backend for a personal blog and knowledge base
//! whose content lives in CouchDB.
//!
//! feedrag follows the database's continuous `_changes` feed, keeps a
//! full-text chunk index in SQLite in step with it, tells the frontend which
//! blog posts to revalidate, and answers chat prompts with context retrieved
//! from the index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │  CouchDB    │──▶│  Listener   │──▶│  SQLite  │
//! │  _changes   │   │ Classify+Mut│   │  FTS5    │
//! └─────────────┘   └──────┬──────┘   └────┬─────┘
//!                          │               │
//!                          ▼               ▼
//!                   ┌────────────┐   ┌──────────┐   ┌───────────┐
//!                   │ Revalidate │   │   HTTP   │──▶│ Generator │
//!                   │ (frontend) │   │  (axum)  │   │ (OpenAI)  │
//!                   └────────────┘   └──────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! feedrag init                 # create database
//! feedrag listen               # follow the change feed
//! feedrag serve                # HTTP API + listener
//! feedrag query "tokio tasks"  # search from the terminal
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`listener`] | Change-feed listener, backoff, lifecycle |
//! | [`classify`] | Change classification and revalidation targets |
//! | [`cursor`] | Durable resume cursor |
//! | [`index`] | Index mutations and full reingest |
//! | [`revalidate`] | Frontend revalidation notifier |
//! | [`chunk`] | Markdown chunking and front matter |
//! | [`search`] | FTS5 retrieval |
//! | [`generate`] | Streaming reply generation |
//! | [`chat`] | Chat transcript persistence |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Feed connection errors |

pub mod chat;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod generate;
pub mod index;
pub mod listener;
pub mod migrate;
pub mod models;
pub mod revalidate;
pub mod search;
pub mod server;
