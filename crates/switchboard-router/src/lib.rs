//! Session routing core: agent registry, shared session memory, the
//! duplicate-call guard, and the per-session handoff state machine.

pub mod connector;
pub mod guard;
pub mod handoff;
pub mod memory;
pub mod policy;
pub mod registry;
pub mod router;

pub use connector::{AgentConnector, AgentLink};
pub use guard::{CallGuard, InFlightGuard, Verdict, CIRCUIT_BREAKER};
pub use handoff::{extract_memory_update, HandoffOrigin, HandoffRequest, HandoffTable, ToolKind};
pub use memory::SessionMemoryStore;
pub use policy::{AutoRoute, AutoRoutePolicy};
pub use registry::{validate_address, AgentRegistry};
pub use router::{SessionHandle, SessionPhase, SessionRouter, SessionSnapshot};
