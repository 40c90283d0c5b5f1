//! Crowd management
//!
//! The crowd manager owns a fixed pool of agents and moves them across the
//! navigation mesh one tick at a time. A tick runs in a fixed order:
//!
//! 1. planning: corridor repair, path requests and the path queue
//! 2. snapshot: every agent's kinematic state is copied and the proximity
//!    grid is rebuilt from the copies
//! 3. environment: neighbours and walls are gathered per agent
//! 4. steering: each agent's behaviour pipeline produces a desired velocity
//! 5. commit: off-mesh starts, velocity and position integration,
//!    collision resolution, corridor reconciliation and off-mesh animation
//!
//! Phases 3 and 4 only read the snapshot and write the evaluated agent's
//! own state, so they may run in parallel (`parallel` feature). All writes
//! that other agents can observe happen in phase 5.

use bitflags::bitflags;
use log::{debug, info, warn};
use navcrowd_common::{
    Error, Result, Vec3, clamp_length, dist_2d, length_2d, tween,
};
use navcrowd_query::{NavMeshQuery, PolyRef, QueryFilter, StraightPathPoint};

use crate::environment::{AgentSnapshot, Environment, Neighbour};
use crate::local_boundary::LocalBoundary;
use crate::obstacle_avoidance::ObstacleAvoidanceDebugData;
use crate::path_corridor::{CorridorMove, MAX_PATH_POLYS, PathCorridor};
use crate::path_following::MoveRequestState;
use crate::path_queue::PathQueue;
use crate::pipeline::BehaviorPipeline;
use crate::proximity_grid::{GridAgent, ProximityGrid};
use crate::steering::{EPSILON, OffMeshTrigger, SteeringContext, SteeringFrame};
use crate::NavQueryContext;

/// Stable handle of an agent, reused after removal
pub type AgentId = usize;

/// Default radius of an agent
const DEFAULT_AGENT_RADIUS: f32 = 0.6;

/// Default height of an agent
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;

/// Default max acceleration of an agent
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;

/// Default max speed of an agent
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

/// Agents handed to the path queue per tick
const MAX_QUEUED_REQUESTS: usize = 8;

/// Full path searches run per tick
const PATH_QUEUE_SEARCHES_PER_TICK: usize = 4;

const COLLISION_RESOLVE_ITERS: usize = 4;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;

/// Share of an off-mesh traversal spent moving onto the connection start
const OFFMESH_APPROACH_SHARE: f32 = 0.15;

bitflags! {
    /// Optional per-agent update phases
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct UpdateFlags: u8 {
        /// Steer towards a blend of the next two corners
        const ANTICIPATE_TURNS = 0x01;
        /// Run the collision avoidance behaviour
        const OBSTACLE_AVOIDANCE = 0x02;
        /// Apply separation forces
        const SEPARATION = 0x04;
        /// Shortcut the corridor when the path ahead is visible
        const OPTIMIZE_VIS = 0x08;
        /// Periodically replan the corridor locally
        const OPTIMIZE_TOPO = 0x10;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Where an agent is on the navigation mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum CrowdAgentState {
    /// Not on the mesh; excluded from steering until repositioned
    #[default]
    Invalid,
    /// Traversing a normal navigation mesh polygon
    Walking,
    /// Traversing an off-mesh connection
    OffMesh,
}

/// Agent configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct AgentParams {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    /// Radius of the neighbour and wall search
    pub collision_query_range: f32,
    /// Look-ahead of path visibility optimization
    pub path_optimization_range: f32,
    pub update_flags: UpdateFlags,
    /// Explicit behaviours. Without one the agent gets path following
    /// followed by collision avoidance.
    pub pipeline: Option<BehaviorPipeline>,
    /// Move target requested when the agent is added
    pub destination: Option<Vec3>,
    pub user_data: Option<usize>,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: DEFAULT_AGENT_RADIUS * 12.0,
            path_optimization_range: DEFAULT_AGENT_RADIUS * 30.0,
            update_flags: UpdateFlags::default(),
            pipeline: None,
            destination: None,
            user_data: None,
        }
    }
}

impl AgentParams {
    /// Rejects non-physical values
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f32| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidParam(format!("{} must be positive, got {}", name, v)))
            }
        };
        positive("radius", self.radius)?;
        positive("height", self.height)?;
        positive("max_acceleration", self.max_acceleration)?;
        positive("collision_query_range", self.collision_query_range)?;
        positive("path_optimization_range", self.path_optimization_range)?;
        if !self.max_speed.is_finite() || self.max_speed < 0.0 {
            return Err(Error::InvalidParam(format!(
                "max_speed must be non-negative, got {}",
                self.max_speed
            )));
        }
        if let Some(dest) = self.destination {
            if !dest.is_finite() {
                return Err(Error::InvalidParam(format!("invalid destination {:?}", dest)));
            }
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.validate()?;
        }
        Ok(())
    }
}

/// Something the host should know about that happened during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum CrowdEvent {
    /// A failure was handled locally and the agent carries on
    Recovered { agent: AgentId, error: Error },
    /// The agent left the mesh and is excluded from steering
    Invalidated { agent: AgentId, error: Error },
    OffMeshStarted { agent: AgentId, start: Vec3, end: Vec3 },
    OffMeshCompleted { agent: AgentId },
    /// A full path search failed; the agent keeps its last corridor
    PathFailed { agent: AgentId },
}

/// Progress over an off-mesh connection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffMeshAnimation {
    /// Position when the connection was triggered
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    /// Elapsed time
    pub t: f32,
    /// Total traversal time
    pub tmax: f32,
}

impl OffMeshAnimation {
    fn new(init_pos: Vec3, trigger: OffMeshTrigger, max_speed: f32) -> Self {
        let dist = dist_2d(&trigger.start, &trigger.end);
        let tmax = if max_speed > 0.0 { dist / max_speed * 0.5 } else { 0.0 };
        Self {
            init_pos,
            start_pos: trigger.start,
            end_pos: trigger.end,
            t: 0.0,
            tmax,
        }
    }

    /// Position at the current time; approaches the start first, then
    /// crosses to the end
    fn position(&self) -> Vec3 {
        let ta = self.tmax * OFFMESH_APPROACH_SHARE;
        if self.t < ta {
            let u = tween(self.t, 0.0, ta);
            self.init_pos.lerp(self.start_pos, u)
        } else {
            let u = tween(self.t, ta, self.tmax);
            self.start_pos.lerp(self.end_pos, u)
        }
    }
}

/// An agent in the crowd
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    id: AgentId,
    state: CrowdAgentState,
    params: AgentParams,
    pos: Vec3,
    vel: Vec3,
    /// Desired velocity
    dvel: Vec3,
    desired_speed: f32,
    corridor: PathCorridor,
    boundary: LocalBoundary,
    pipeline: BehaviorPipeline,
    env: Environment,
    anim: Option<OffMeshAnimation>,
    /// Off-mesh connection entered during steering, started on commit
    pending_offmesh: Option<OffMeshTrigger>,
}

impl CrowdAgent {
    fn new(id: AgentId, mut params: AgentParams) -> Self {
        let pipeline = params
            .pipeline
            .take()
            .unwrap_or_else(|| BehaviorPipeline::path_following(None));
        let mut corridor = PathCorridor::new();
        corridor.init(MAX_PATH_POLYS);
        Self {
            id,
            state: CrowdAgentState::Invalid,
            params,
            pos: Vec3::ZERO,
            vel: Vec3::ZERO,
            dvel: Vec3::ZERO,
            desired_speed: 0.0,
            corridor,
            boundary: LocalBoundary::new(),
            pipeline,
            env: Environment::new(),
            anim: None,
            pending_offmesh: None,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn state(&self) -> CrowdAgentState {
        self.state
    }

    /// Parameters; the pipeline lives in [`CrowdAgent::pipeline`]
    pub fn params(&self) -> &AgentParams {
        &self.params
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn vel(&self) -> Vec3 {
        self.vel
    }

    pub fn desired_vel(&self) -> Vec3 {
        self.dvel
    }

    pub fn corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    pub fn pipeline(&self) -> &BehaviorPipeline {
        &self.pipeline
    }

    pub fn neighbours(&self) -> &[Neighbour] {
        self.env.neighbours()
    }

    pub fn offmesh_animation(&self) -> Option<&OffMeshAnimation> {
        self.anim.as_ref()
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            pos: self.pos,
            vel: self.vel,
            dvel: self.dvel,
            radius: self.params.radius,
            height: self.params.height,
            state: self.state,
        }
    }

    fn stop(&mut self) {
        self.vel = Vec3::ZERO;
        self.dvel = Vec3::ZERO;
        self.desired_speed = 0.0;
    }

    fn move_state(&self) -> MoveRequestState {
        self.pipeline
            .path_follower()
            .map_or(MoveRequestState::None, |pf| pf.state())
    }

    fn view(&self) -> AgentView {
        let pf = self.pipeline.path_follower();
        AgentView {
            id: self.id,
            state: self.state,
            position: self.pos,
            velocity: self.vel,
            desired_velocity: self.dvel,
            desired_speed: self.desired_speed,
            radius: self.params.radius,
            height: self.params.height,
            max_speed: self.params.max_speed,
            move_state: self.move_state(),
            target: pf
                .filter(|pf| pf.target_ref().is_valid())
                .map(|pf| pf.target_pos()),
            poly: self.corridor.first_poly(),
            corners: pf.map(|pf| pf.corners().to_vec()).unwrap_or_default(),
            neighbours: self.env.neighbours().to_vec(),
            offmesh: self.anim,
            user_data: self.params.user_data,
        }
    }
}

/// Copy of an agent's public state
#[derive(Debug, Clone, PartialEq)]
pub struct AgentView {
    pub id: AgentId,
    pub state: CrowdAgentState,
    pub position: Vec3,
    pub velocity: Vec3,
    pub desired_velocity: Vec3,
    pub desired_speed: f32,
    pub radius: f32,
    pub height: f32,
    pub max_speed: f32,
    pub move_state: MoveRequestState,
    /// Move target, when one is set
    pub target: Option<Vec3>,
    /// Polygon containing the agent
    pub poly: PolyRef,
    pub corners: Vec<StraightPathPoint>,
    pub neighbours: Vec<Neighbour>,
    pub offmesh: Option<OffMeshAnimation>,
    pub user_data: Option<usize>,
}

/// Crowd manager
pub struct CrowdManager<'a> {
    nav: NavQueryContext<'a>,
    max_agents: usize,
    max_agent_radius: f32,
    agents: Vec<Option<CrowdAgent>>,
    /// Free slots, highest id first so the lowest is popped
    free_ids: Vec<AgentId>,
    snapshots: Vec<Option<AgentSnapshot>>,
    grid: ProximityGrid,
    path_queue: PathQueue,
}

impl std::fmt::Debug for CrowdManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrowdManager")
            .field("nav", &self.nav)
            .field("max_agents", &self.max_agents)
            .field("max_agent_radius", &self.max_agent_radius)
            .field("agent_count", &self.agent_count())
            .finish_non_exhaustive()
    }
}

impl<'a> CrowdManager<'a> {
    /// Creates a crowd of at most `max_agents` agents over `query`.
    ///
    /// `max_agent_radius` sizes the proximity grid and the extents used to
    /// find agents' polygons.
    pub fn new(max_agents: usize, max_agent_radius: f32, query: &'a dyn NavMeshQuery) -> Result<Self> {
        if max_agents == 0 {
            return Err(Error::InvalidParam("max_agents must be at least 1".into()));
        }
        if !max_agent_radius.is_finite() || max_agent_radius <= 0.0 {
            return Err(Error::InvalidParam(format!(
                "max_agent_radius must be positive, got {}",
                max_agent_radius
            )));
        }

        let half_extents = Vec3::new(
            max_agent_radius * 2.0,
            max_agent_radius * 1.5,
            max_agent_radius * 2.0,
        );
        info!(
            "Crowd initialized: {} agents, max radius {}",
            max_agents, max_agent_radius
        );

        Ok(Self {
            nav: NavQueryContext::new(query, half_extents),
            max_agents,
            max_agent_radius,
            agents: vec![None; max_agents],
            free_ids: (0..max_agents).rev().collect(),
            snapshots: Vec::with_capacity(max_agents),
            grid: ProximityGrid::new(max_agent_radius * 3.0),
            path_queue: PathQueue::new(MAX_PATH_POLYS),
        })
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    pub fn max_agent_radius(&self) -> f32 {
        self.max_agent_radius
    }

    /// Number of agents in the pool
    pub fn agent_count(&self) -> usize {
        self.agents.iter().flatten().count()
    }

    pub fn nav_context(&self) -> &NavQueryContext<'a> {
        &self.nav
    }

    /// Filter used by all agents. Changes apply from the next tick;
    /// corridors crossing excluded polygons are replanned.
    pub fn query_filter_mut(&mut self) -> &mut QueryFilter {
        self.nav.filter_mut()
    }

    /// The proximity grid as of the last tick
    pub fn grid(&self) -> &ProximityGrid {
        &self.grid
    }

    /// Adds an agent at the polygon nearest to `pos`.
    ///
    /// When no polygon is near the agent is still added, in `Invalid`
    /// state. Fails with `CapacityExceeded` when the pool is full.
    pub fn add_agent(&mut self, pos: Vec3, params: &AgentParams) -> Result<AgentId> {
        params.validate()?;
        let id = self
            .free_ids
            .pop()
            .ok_or(Error::CapacityExceeded(self.max_agents))?;

        let mut agent = CrowdAgent::new(id, params.clone());

        // Find nearest position on navmesh and place the agent there
        match self.nav.find_nearest(pos) {
            Some((r, nearest)) => {
                agent.corridor.reset(r, nearest);
                agent.pos = nearest;
                agent.state = CrowdAgentState::Walking;
            }
            None => {
                warn!("Agent {} added off the mesh at {:?}", id, pos);
                agent.corridor.reset(PolyRef::NULL, pos);
                agent.pos = pos;
            }
        }
        agent.boundary.reset();
        request_destination(&mut agent, &self.nav);

        debug!("Added agent {} at {:?}", id, agent.pos);
        self.agents[id] = Some(agent);
        Ok(id)
    }

    /// Removes an agent and frees its id
    pub fn remove_agent(&mut self, id: AgentId) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(id)
            .and_then(Option::take)
            .ok_or(Error::InvalidAgentHandle(id))?;
        if let Some(pf) = agent.pipeline.path_follower_mut() {
            if let Some(handle) = pf.reset_move_target() {
                self.path_queue.cancel(handle);
            }
        }
        self.free_ids.push(id);
        self.free_ids.sort_unstable_by(|a, b| b.cmp(a));
        debug!("Removed agent {}", id);
        Ok(())
    }

    /// Requests the agent to move to the polygon nearest to `pos`.
    ///
    /// Returns false when no polygon is near `pos` or the agent has no
    /// path following behaviour.
    pub fn request_move_target(&mut self, id: AgentId, pos: Vec3) -> Result<bool> {
        let agent = slot_mut(&mut self.agents, id)?;
        let Some((r, target)) = self.nav.find_nearest(pos) else {
            return Ok(false);
        };
        let Some(pf) = agent.pipeline.path_follower_mut() else {
            return Ok(false);
        };
        if let Some(handle) = pf.reset_move_target() {
            self.path_queue.cancel(handle);
        }
        pf.request_move_target(r, target);
        debug!("Agent {} move target {:?}", id, target);
        Ok(true)
    }

    /// Nudges the move target to `pos` without a full replan if possible
    pub fn adjust_move_target(&mut self, id: AgentId, pos: Vec3) -> Result<bool> {
        let agent = slot_mut(&mut self.agents, id)?;
        let Some((r, target)) = self.nav.find_nearest(pos) else {
            return Ok(false);
        };
        let Some(pf) = agent.pipeline.path_follower_mut() else {
            return Ok(false);
        };
        pf.adjust_move_target(r, target, &mut agent.corridor, &self.nav);
        Ok(true)
    }

    /// Steers the agent with a fixed velocity instead of a path
    pub fn request_move_velocity(&mut self, id: AgentId, vel: Vec3) -> Result<bool> {
        if !vel.is_finite() {
            return Err(Error::InvalidParam(format!("invalid velocity {:?}", vel)));
        }
        let agent = slot_mut(&mut self.agents, id)?;
        let Some(pf) = agent.pipeline.path_follower_mut() else {
            return Ok(false);
        };
        if let Some(handle) = pf.request_move_velocity(vel) {
            self.path_queue.cancel(handle);
        }
        Ok(true)
    }

    /// Drops the agent's move request; it comes to rest
    pub fn reset_move_target(&mut self, id: AgentId) -> Result<bool> {
        let agent = slot_mut(&mut self.agents, id)?;
        let Some(pf) = agent.pipeline.path_follower_mut() else {
            return Ok(false);
        };
        if let Some(handle) = pf.reset_move_target() {
            self.path_queue.cancel(handle);
        }
        Ok(true)
    }

    /// Replaces the agent's parameters. A pipeline in `params` replaces
    /// the current one; otherwise the current one is kept.
    pub fn update_agent_parameters(&mut self, id: AgentId, params: &AgentParams) -> Result<()> {
        params.validate()?;
        let agent = slot_mut(&mut self.agents, id)?;
        let mut params = params.clone();
        if let Some(pipeline) = params.pipeline.take() {
            replace_pipeline(agent, pipeline, &mut self.path_queue);
            agent.params = params;
            request_destination(agent, &self.nav);
        } else {
            agent.params = params;
        }
        Ok(())
    }

    /// Replaces the agent's behaviours
    pub fn set_behavior_pipeline(&mut self, id: AgentId, pipeline: BehaviorPipeline) -> Result<()> {
        pipeline.validate()?;
        let agent = slot_mut(&mut self.agents, id)?;
        replace_pipeline(agent, pipeline, &mut self.path_queue);
        request_destination(agent, &self.nav);
        Ok(())
    }

    /// Teleports the agent to the polygon nearest to `pos` and replans
    /// its move request from there.
    ///
    /// Returns false, leaving the agent untouched, when no polygon is near.
    pub fn update_agent_position(&mut self, id: AgentId, pos: Vec3) -> Result<bool> {
        let agent = slot_mut(&mut self.agents, id)?;
        let Some((r, nearest)) = self.nav.find_nearest(pos) else {
            return Ok(false);
        };

        agent.corridor.reset(r, nearest);
        agent.boundary.reset();
        agent.pos = nearest;
        agent.stop();
        agent.anim = None;
        agent.pending_offmesh = None;
        agent.state = CrowdAgentState::Walking;

        if let Some(pf) = agent.pipeline.path_follower_mut() {
            let target_ref = pf.target_ref();
            if target_ref.is_valid()
                && !matches!(pf.state(), MoveRequestState::None | MoveRequestState::Velocity)
            {
                let target_pos = pf.target_pos();
                if let Some(handle) = pf.reset_move_target() {
                    self.path_queue.cancel(handle);
                }
                pf.request_move_target(target_ref, target_pos);
            }
        }
        debug!("Agent {} moved to {:?}", id, nearest);
        Ok(true)
    }

    /// True while the agent wants to move and does
    pub fn agent_is_moving(&self, id: AgentId) -> Result<bool> {
        let agent = slot(&self.agents, id)?;
        Ok(agent.desired_speed > EPSILON && length_2d(&agent.vel) > EPSILON)
    }

    pub fn agent(&self, id: AgentId) -> Result<&CrowdAgent> {
        slot(&self.agents, id)
    }

    pub fn get_agent(&self, id: AgentId) -> Result<AgentView> {
        slot(&self.agents, id).map(CrowdAgent::view)
    }

    /// Views of all agents in the pool, by id
    pub fn get_active_agents(&self) -> Vec<AgentView> {
        self.agents.iter().flatten().map(CrowdAgent::view).collect()
    }

    pub fn active_agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().flatten().map(|a| a.id).collect()
    }

    /// Avoidance samples of the agent's last tick, if its collision
    /// avoidance behaviour records them
    pub fn avoidance_debug(&self, id: AgentId) -> Result<Option<&ObstacleAvoidanceDebugData>> {
        let agent = slot(&self.agents, id)?;
        Ok(agent
            .pipeline
            .collision_avoidance()
            .and_then(|ca| ca.debug_data()))
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// Per-agent failures never abort the tick; they are returned as
    /// events. Only a non-positive or non-finite `dt` is an error.
    pub fn update(&mut self, dt: f32) -> Result<Vec<CrowdEvent>> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(Error::InvalidParam(format!("invalid time step {}", dt)));
        }

        let mut events = Vec::new();
        self.update_planning(dt, &mut events);
        self.take_snapshots();
        self.update_environment(&mut events);
        self.update_steering(dt, &mut events);

        self.start_offmesh(&mut events);
        self.integrate(dt);
        self.resolve_collisions();
        self.move_along_corridors(&mut events);
        self.update_offmesh(dt, &mut events);

        Ok(events)
    }

    fn update_planning(&mut self, dt: f32, events: &mut Vec<CrowdEvent>) {
        let nav = &self.nav;

        // Repair corridors and targets
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::Walking {
                continue;
            }
            let Some(pf) = agent.pipeline.path_follower_mut() else {
                continue;
            };
            match pf.check_path_validity(agent.id, &mut agent.corridor, &mut agent.boundary, nav, dt) {
                Ok(()) => agent.pos = agent.corridor.pos(),
                Err(error) => {
                    warn!("Agent {} invalidated: {}", agent.id, error);
                    agent.state = CrowdAgentState::Invalid;
                    agent.stop();
                    events.push(CrowdEvent::Invalidated { agent: agent.id, error });
                }
            }
        }

        // Quick searches for fresh requests
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::Walking {
                continue;
            }
            if let Some(pf) = agent.pipeline.path_follower_mut() {
                pf.update_quick_search(&mut agent.corridor, &mut agent.boundary, nav);
            }
        }

        // Queue the longest waiting requests first
        let mut waiting: Vec<(f32, AgentId)> = self
            .agents
            .iter()
            .flatten()
            .filter(|a| a.move_state() == MoveRequestState::WaitingForQueue)
            .filter_map(|a| a.pipeline.path_follower().map(|pf| (pf.replan_time(), a.id)))
            .collect();
        waiting.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        for &(_, id) in waiting.iter().take(MAX_QUEUED_REQUESTS) {
            let Some(agent) = self.agents[id].as_mut() else {
                continue;
            };
            if let Some(pf) = agent.pipeline.path_follower_mut() {
                pf.enqueue(&agent.corridor, &mut self.path_queue, nav);
            }
        }

        self.path_queue.update(PATH_QUEUE_SEARCHES_PER_TICK, nav);

        // Pick up finished searches
        for agent in self.agents.iter_mut().flatten() {
            let Some(pf) = agent.pipeline.path_follower_mut() else {
                continue;
            };
            if let Err(err) =
                pf.poll_path_queue(&mut agent.corridor, &mut agent.boundary, &mut self.path_queue, nav)
            {
                debug!("Agent {} path request failed: {}", agent.id, err);
                events.push(CrowdEvent::PathFailed { agent: agent.id });
            }
        }

        // Optimize the topology of the agent that waited longest
        let mut due: Option<(f32, AgentId)> = None;
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::Walking
                || !agent.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            let Some(pf) = agent.pipeline.path_follower_mut() else {
                continue;
            };
            if pf.tick_topology(dt) && due.is_none_or(|(t, _)| pf.topology_opt_time() > t) {
                due = Some((pf.topology_opt_time(), agent.id));
            }
        }
        if let Some((_, id)) = due {
            if let Some(agent) = self.agents[id].as_mut() {
                if let Some(pf) = agent.pipeline.path_follower_mut() {
                    pf.optimize_topology(&mut agent.corridor, nav);
                }
            }
        }
    }

    fn take_snapshots(&mut self) {
        self.snapshots.clear();
        self.snapshots
            .extend(self.agents.iter().map(|a| a.as_ref().map(CrowdAgent::snapshot)));

        self.grid.clear();
        for snap in self.snapshots.iter().flatten() {
            if snap.state == CrowdAgentState::Invalid {
                continue;
            }
            self.grid.add_agent(GridAgent {
                id: snap.id,
                pos: snap.pos,
                radius: snap.radius,
            });
        }
    }

    fn update_environment(&mut self, events: &mut Vec<CrowdEvent>) {
        let nav = &self.nav;
        let grid = &self.grid;
        let snapshots = self.snapshots.as_slice();

        let found = for_each_agent(&mut self.agents, |agent, found| {
            if agent.state != CrowdAgentState::Walking {
                agent.env.clear();
                return;
            }
            let range = agent.params.collision_query_range;

            // Update the collision boundary after certain distance has been
            // passed or if it has become invalid
            if agent.boundary.needs_update(agent.pos, range * 0.25) || !agent.boundary.is_valid(nav) {
                if let Err(error) = agent
                    .boundary
                    .update(agent.corridor.first_poly(), agent.pos, range, nav)
                {
                    agent.boundary.reset();
                    found.push(CrowdEvent::Recovered { agent: agent.id, error });
                }
            }

            let snapshot = agent.snapshot();
            agent.env.gather_neighbours(&snapshot, range, grid, snapshots);
            agent.env.set_walls(agent.boundary.segments());
        });
        events.extend(found);
    }

    fn update_steering(&mut self, dt: f32, events: &mut Vec<CrowdEvent>) {
        let nav = &self.nav;
        let snapshots = self.snapshots.as_slice();

        let found = for_each_agent(&mut self.agents, |agent, found| {
            if agent.state != CrowdAgentState::Walking {
                if agent.state == CrowdAgentState::Invalid {
                    agent.stop();
                }
                return;
            }

            let snapshot = agent.snapshot();
            let ctx = SteeringContext {
                agent: &snapshot,
                params: &agent.params,
                env: &agent.env,
                snapshots,
                nav,
                dt,
            };
            let mut frame = SteeringFrame::new(&mut agent.corridor);
            let dvel = agent.pipeline.update(&ctx, &mut frame);

            agent.dvel = dvel;
            agent.desired_speed = length_2d(&dvel);
            agent.pending_offmesh = frame.offmesh;
            found.extend(
                frame
                    .recovered
                    .into_iter()
                    .map(|error| CrowdEvent::Recovered { agent: agent.id, error }),
            );
        });
        events.extend(found);
    }

    fn start_offmesh(&mut self, events: &mut Vec<CrowdEvent>) {
        for agent in self.agents.iter_mut().flatten() {
            let Some(trigger) = agent.pending_offmesh.take() else {
                continue;
            };
            let anim = OffMeshAnimation::new(agent.pos, trigger, agent.params.max_speed);
            debug!(
                "Agent {} entering off-mesh connection {:?} -> {:?}",
                agent.id, anim.start_pos, anim.end_pos
            );
            agent.anim = Some(anim);
            agent.state = CrowdAgentState::OffMesh;
            agent.stop();
            events.push(CrowdEvent::OffMeshStarted {
                agent: agent.id,
                start: trigger.start,
                end: trigger.end,
            });
        }
    }

    fn integrate(&mut self, dt: f32) {
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::Walking {
                continue;
            }
            // Fake dynamic constraint
            let max_delta = agent.params.max_acceleration * dt;
            let dv = clamp_length(&(agent.dvel - agent.vel), max_delta);
            agent.vel = clamp_length(&(agent.vel + dv), agent.params.max_speed);

            // Integrate
            if length_2d(&agent.vel) > EPSILON {
                agent.pos += agent.vel * dt;
            } else {
                agent.vel = Vec3::ZERO;
            }
        }
    }

    fn resolve_collisions(&mut self) {
        let mut disp = vec![Vec3::ZERO; self.agents.len()];

        for _ in 0..COLLISION_RESOLVE_ITERS {
            for (idx0, entry) in self.agents.iter().enumerate() {
                disp[idx0] = Vec3::ZERO;
                let Some(ag) = entry else {
                    continue;
                };
                if ag.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut d = Vec3::ZERO;
                let mut w = 0.0;
                for nei in ag.env.neighbours() {
                    let idx1 = nei.agent;
                    let Some(other) = self.agents.get(idx1).and_then(Option::as_ref) else {
                        continue;
                    };
                    if other.state == CrowdAgentState::Invalid {
                        continue;
                    }

                    let mut diff = Vec3::new(ag.pos.x - other.pos.x, 0.0, ag.pos.z - other.pos.z);
                    let r = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > r * r {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen;
                    if dist < EPSILON {
                        // Agents on top of each other, try to choose diverging separation directions
                        let side = if length_2d(&ag.dvel) > EPSILON {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        } else {
                            Vec3::X
                        };
                        diff = if idx0 > idx1 { -side } else { side };
                        pen = 0.01;
                    } else {
                        pen = (1.0 / dist) * ((r - dist) * 0.5) * COLLISION_RESOLVE_FACTOR;
                    }

                    d += diff * pen;
                    w += 1.0;
                }

                if w > EPSILON {
                    disp[idx0] = d * (1.0 / w);
                }
            }

            for (entry, d) in self.agents.iter_mut().zip(&disp) {
                if let Some(ag) = entry {
                    if ag.state == CrowdAgentState::Walking {
                        ag.pos += *d;
                    }
                }
            }
        }
    }

    fn move_along_corridors(&mut self, events: &mut Vec<CrowdEvent>) {
        let nav = &self.nav;
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::Walking {
                continue;
            }

            // Move along navmesh
            match agent.corridor.move_position(agent.pos, nav) {
                Ok(CorridorMove::Moved) => {}
                Ok(CorridorMove::Snapped) => {
                    warn!("Agent {} left its corridor and was snapped back", agent.id);
                    agent.boundary.reset();
                    events.push(CrowdEvent::Recovered {
                        agent: agent.id,
                        error: Error::CorridorDesync(format!(
                            "agent {} snapped onto {:?}",
                            agent.id,
                            agent.corridor.first_poly()
                        )),
                    });
                }
                Err(error) => {
                    warn!("Agent {} invalidated: {}", agent.id, error);
                    agent.state = CrowdAgentState::Invalid;
                    agent.stop();
                    events.push(CrowdEvent::Invalidated { agent: agent.id, error });
                    continue;
                }
            }

            // Get valid constrained position back
            agent.pos = agent.corridor.pos();

            // If not using path, truncate the corridor to just one poly
            if matches!(
                agent.move_state(),
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                let first = agent.corridor.first_poly();
                agent.corridor.reset(first, agent.pos);
            }
        }
    }

    fn update_offmesh(&mut self, dt: f32, events: &mut Vec<CrowdEvent>) {
        for agent in self.agents.iter_mut().flatten() {
            if agent.state != CrowdAgentState::OffMesh {
                continue;
            }
            let Some(anim) = agent.anim.as_mut() else {
                agent.state = CrowdAgentState::Walking;
                continue;
            };

            anim.t += dt;
            if anim.t >= anim.tmax {
                // Reset animation
                agent.pos = anim.end_pos;
                agent.anim = None;
                // Prepare agent for walking
                agent.state = CrowdAgentState::Walking;
                debug!("Agent {} left off-mesh connection", agent.id);
                events.push(CrowdEvent::OffMeshCompleted { agent: agent.id });
                continue;
            }

            agent.pos = anim.position();
            agent.stop();
        }
    }
}

fn slot(agents: &[Option<CrowdAgent>], id: AgentId) -> Result<&CrowdAgent> {
    agents
        .get(id)
        .and_then(Option::as_ref)
        .ok_or(Error::InvalidAgentHandle(id))
}

fn slot_mut(agents: &mut [Option<CrowdAgent>], id: AgentId) -> Result<&mut CrowdAgent> {
    agents
        .get_mut(id)
        .and_then(Option::as_mut)
        .ok_or(Error::InvalidAgentHandle(id))
}

/// Swaps in a new pipeline, cancelling the old one's queued search
fn replace_pipeline(agent: &mut CrowdAgent, pipeline: BehaviorPipeline, queue: &mut PathQueue) {
    if let Some(pf) = agent.pipeline.path_follower_mut() {
        if let Some(handle) = pf.reset_move_target() {
            queue.cancel(handle);
        }
    }
    agent.pipeline = pipeline;
    agent.corridor.reset(agent.corridor.first_poly(), agent.pos);
}

/// Requests the pipeline's destination, falling back to the one in the
/// agent parameters
fn request_destination(agent: &mut CrowdAgent, nav: &NavQueryContext) {
    let fallback = agent.params.destination;
    let Some(pf) = agent.pipeline.path_follower_mut() else {
        return;
    };
    let Some(dest) = pf.destination.or(fallback) else {
        return;
    };
    match nav.find_nearest(dest) {
        Some((r, target)) => pf.request_move_target(r, target),
        None => warn!("Agent {} destination {:?} is off the mesh", agent.id, dest),
    }
}

/// Runs `f` on every agent, in parallel with the `parallel` feature.
/// Events are returned in agent order either way.
fn for_each_agent<F>(agents: &mut [Option<CrowdAgent>], f: F) -> Vec<CrowdEvent>
where
    F: Fn(&mut CrowdAgent, &mut Vec<CrowdEvent>) + Sync + Send,
{
    #[cfg(not(feature = "parallel"))]
    {
        let mut events = Vec::new();
        for agent in agents.iter_mut().flatten() {
            f(agent, &mut events);
        }
        events
    }

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        agents
            .par_iter_mut()
            .flatten()
            .flat_map_iter(|agent| {
                let mut events = Vec::new();
                f(agent, &mut events);
                events
            })
            .collect()
    }
}
