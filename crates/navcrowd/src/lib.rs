//! Multi-agent crowd simulation on navigation meshes
//!
//! This crate moves groups of agents across a shared navigation mesh. Every
//! agent follows a path corridor towards its target, steers with an ordered
//! pipeline of behaviours and avoids its neighbours and nearby walls with a
//! sampling velocity obstacle solver.
//!
//! # Features
//!
//! - **Agent Management**: A fixed pool of agents with stable, reusable ids
//! - **Path Following**: Corridors kept in sync with the agent's movement,
//!   replanned when the mesh or the filter changes under them
//! - **Steering Pipelines**: Seek, arrive, separation, alignment, cohesion
//!   and flocking composed per agent
//! - **Collision Avoidance**: Adaptive or grid sampled velocity obstacles
//! - **Off-mesh Connections**: Animated traversal of jumps and ladders
//! - **Parallel Steering**: Neighbour gathering and steering run on rayon
//!   with the `parallel` feature
//!
//! # Example
//!
//! ```rust,ignore
//! use navcrowd::{AgentParams, CrowdManager};
//! use navcrowd_query::PolyMeshQuery;
//!
//! let query = PolyMeshQuery::new(&mesh);
//! let mut crowd = CrowdManager::new(64, 0.6, &query)?;
//!
//! let params = AgentParams {
//!     radius: 0.6,
//!     max_speed: 3.5,
//!     destination: Some(target),
//!     ..Default::default()
//! };
//! let agent = crowd.add_agent(start, &params)?;
//!
//! for event in crowd.update(1.0 / 60.0)? {
//!     log::debug!("{:?}", event);
//! }
//! let view = crowd.get_agent(agent)?;
//! ```
//!
//! # Architecture
//!
//! - [`CrowdManager`]: Agent pool and the per-tick update
//! - [`BehaviorPipeline`]: Ordered steering behaviours of one agent
//! - [`PathCorridor`]: The polygons between an agent and its target
//! - [`LocalBoundary`]: Walls near an agent
//! - [`ObstacleAvoidanceQuery`]: Velocity obstacle sampling
//! - [`ProximityGrid`]: Spatial hash for neighbour lookups
//! - [`PathQueue`]: Budgeted full path searches

pub mod collision_avoidance;
pub mod crowd;
pub mod environment;
pub mod local_boundary;
pub mod nav_context;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod path_following;
pub mod path_queue;
pub mod pipeline;
pub mod proximity_grid;
pub mod steering;

pub use collision_avoidance::*;
pub use crowd::*;
pub use environment::*;
pub use local_boundary::*;
pub use nav_context::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use path_following::*;
pub use path_queue::*;
pub use pipeline::*;
pub use proximity_grid::*;
pub use steering::*;
