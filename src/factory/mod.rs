//! App Factory back-end.
//!
//! ## Overview
//!
//! A user submits a prompt, the factory provisions an isolated workspace,
//! asks a generation backend to write a web app into it, runs an optional
//! dependency install and build, and publishes a preview URL. Progress is
//! persisted as a conversation ledger and streamed to clients over a
//! WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, CORS, graceful shutdown)    │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (snapshot + replay + live events)  │
//!                       │         │                                        │
//!                       │         │ ProjectOrchestrator::start_run()       │
//!                       │         v                                        │
//!                       │  orchestrator.rs  (lifecycle, one run/project)   │
//!                       │    ├─ tasks.rs       (RunRegistry)               │
//!                       │    ├─ generation.rs  (Claude CLI backend)        │
//!                       │    ├─ fallback.rs    (static scaffold)           │
//!                       │    ├─ build_pipeline.rs (install + build)        │
//!                       │    └─ ledger.rs      (assistant message stream)  │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | `Project`, `ProjectMessage`, `ProjectEvent`, statuses   |
//! | `db`         | SQLite schema and queries behind `DbHandle`             |
//! | `repository` | `ProjectRepository` trait over the database             |
//! | `events`     | Per-project `EventBus` with bounded replay history      |
//! | `workspace`  | Workspace layout, sandboxed path resolution, listings   |
//! | `command`    | `CommandRunner` trait and the process-backed runner     |
//! | `preview`    | Preview URL construction                                |
//!
//! ## Typical Run
//!
//! 1. `POST /api/projects` → `create_project` then `start_run`.
//! 2. The run claims the project's slot in the `RunRegistry`, creates a
//!    pending assistant message and moves the project to `running`.
//! 3. The Claude backend streams assistant text and tool use into the
//!    ledger and the event bus. If it is unavailable or fails, the static
//!    scaffold generator writes a minimal app instead.
//! 4. `PostGenerationPipeline` installs dependencies and builds when a
//!    `package.json` is present, possibly moving the preview entry to the
//!    build output.
//! 5. The preview URL is stored, `preview_ready` is emitted and the project
//!    becomes `ready`.

pub mod api;
pub mod build_pipeline;
pub mod command;
pub mod db;
pub mod events;
pub mod fallback;
pub mod generation;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod preview;
pub mod repository;
pub mod server;
pub mod tasks;
pub mod workspace;
pub mod ws;
