//! CRM back-end: tenant-scoped REST API over SQLite.
//!
//! ## Overview
//!
//! Each organization works its own lead pipeline (a kanban of configurable
//! stages), tasks, service orders and projects. Mutations are pushed to
//! connected clients of the same organization over a WebSocket. A
//! superadmin manages plans, organizations and users.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs        (AppState, ApiError, leads)  │
//! └──────────┘ WebSocket│    ├─ work_api.rs   (projects, tasks, OS)        │
//!                       │    ├─ admin_api.rs  (superadmin console)         │
//!                       │    └─ auth.rs       (Tenant / SuperAdmin)        │
//!                       │         │                                        │
//!                       │         │ DbHandle::call(|db| ...)               │
//!                       │         v                                        │
//!                       │  db/  (CrmDb: tenancy, pipeline, work, reports)  │
//!                       │         │                                        │
//!                       │         │ Board::apply_move()                    │
//!                       │         v                                        │
//!                       │  board.rs  (ordered-column reducer)              │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Records, enums, create/update payloads, views           |
//! | `validate` | Email/phone checks and slugs                            |
//! | `import`   | CSV templates and the row-by-row `RowSink` importer     |
//! | `ws`       | `WsMessage`, `ChangeEvent` and `broadcast_message()`    |
//!
//! ## Typical Request Flow (drag a lead to another stage)
//!
//! 1. `PATCH /api/leads/{id}/move` → `api::move_lead()`; the `Tenant`
//!    extractor resolves the session and the organization.
//! 2. `CrmDb::move_lead()` loads both stage columns into a `Board`,
//!    applies the move and rewrites status and positions in one
//!    transaction.
//! 3. A `LeadMoved` change is broadcast; sockets of the same organization
//!    forward it to their clients.

pub mod admin_api;
pub mod api;
pub mod auth;
pub mod board;
pub mod db;
pub mod import;
pub mod models;
pub mod server;
pub mod validate;
pub mod work_api;
pub mod ws;
