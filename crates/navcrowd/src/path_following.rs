//! Path following behaviour
//!
//! Owns an agent's move request. The crowd drives the planning side of
//! the request between ticks (validity checks, quick searches, the shared
//! path queue) while [`PathFollowing::evaluate`] steers along the corridor
//! during the tick.
//!
//! Request life cycle:
//!
//! ```text
//! None ──request──▶ Requesting ──quick search reaches target──▶ Valid
//!                       │
//!                       └──partial──▶ WaitingForQueue ──▶ WaitingForPath ──▶ Valid | Failed
//! ```

use log::{debug, warn};
use navcrowd_common::{
    Error, Result, Vec3, clamp_length, dist_2d, dist_sqr_2d, length_2d, normalize_2d,
};
use navcrowd_query::{PolyRef, StraightPathFlags, StraightPathPoint};

use crate::local_boundary::LocalBoundary;
use crate::path_corridor::PathCorridor;
use crate::path_queue::{PathQueue, PathQueueRef, PathQueueStatus};
use crate::steering::{OffMeshTrigger, SteeringContext, SteeringFrame, SteeringOutput};
use crate::{NavQueryContext, UpdateFlags};

/// The maximum number of corners an agent looks ahead in the path
pub const MAX_CORNERS: usize = 4;

/// Number of corridor polygons checked for validity each tick
const CHECK_LOOKAHEAD: usize = 10;

/// Default seconds between replans, also spent on a partial path before
/// trying to reach the target again
const TARGET_REPLAN_DELAY: f32 = 1.0;

/// Result size of the quick search run right after a request
const MAX_QUICK_SEARCH_RES: usize = 32;

/// Seconds between topology optimizations of one agent
pub(crate) const OPT_TIME_THR: f32 = 0.5;

/// State of an agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    /// Steered by a requested velocity, no path
    Velocity,
}

/// Follows the corridor towards the move target
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct PathFollowing {
    /// Target requested as soon as the behaviour is installed
    pub destination: Option<Vec3>,
    /// Look-ahead of visibility optimization, defaults to the agent's
    /// `path_optimization_range`
    pub path_optimization_range: Option<f32>,
    /// Minimum seconds between two replans of the same request
    pub replan_interval: f32,

    #[cfg_attr(feature = "serialization", serde(skip))]
    state: MoveRequestState,
    #[cfg_attr(feature = "serialization", serde(skip))]
    target_ref: PolyRef,
    /// Target position, or the requested velocity in `Velocity` state
    #[cfg_attr(feature = "serialization", serde(skip))]
    target_pos: Vec3,
    #[cfg_attr(feature = "serialization", serde(skip))]
    path_queue_ref: Option<PathQueueRef>,
    /// Time since the path last became valid
    #[cfg_attr(feature = "serialization", serde(skip))]
    replan_time: f32,
    /// Time since the last path request
    #[cfg_attr(feature = "serialization", serde(skip))]
    request_age: f32,
    #[cfg_attr(feature = "serialization", serde(skip))]
    topology_opt_time: f32,
    /// The target moved while a replan was not yet allowed
    #[cfg_attr(feature = "serialization", serde(skip))]
    target_moved: bool,
    #[cfg_attr(feature = "serialization", serde(skip))]
    corners: Vec<StraightPathPoint>,
}

impl Default for PathFollowing {
    fn default() -> Self {
        Self {
            destination: None,
            path_optimization_range: None,
            replan_interval: TARGET_REPLAN_DELAY,
            state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            path_queue_ref: None,
            replan_time: 0.0,
            request_age: f32::MAX,
            topology_opt_time: 0.0,
            target_moved: false,
            corners: Vec::with_capacity(MAX_CORNERS),
        }
    }
}

impl PathFollowing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(destination: Vec3) -> Self {
        Self {
            destination: Some(destination),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.replan_interval.is_finite() || self.replan_interval < 0.0 {
            return Err(Error::InvalidParam(format!(
                "replan_interval must be a non-negative number, got {}",
                self.replan_interval
            )));
        }
        if let Some(range) = self.path_optimization_range {
            if !range.is_finite() || range <= 0.0 {
                return Err(Error::InvalidParam(format!(
                    "path_optimization_range must be positive, got {}",
                    range
                )));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> MoveRequestState {
        self.state
    }

    pub fn target_ref(&self) -> PolyRef {
        self.target_ref
    }

    /// Target position, or the requested velocity in `Velocity` state
    pub fn target_pos(&self) -> Vec3 {
        self.target_pos
    }

    /// Corners found during the last evaluation
    pub fn corners(&self) -> &[StraightPathPoint] {
        &self.corners
    }

    pub(crate) fn replan_time(&self) -> f32 {
        self.replan_time
    }

    pub(crate) fn topology_opt_time(&self) -> f32 {
        self.topology_opt_time
    }

    /// Starts a new move request. Never delayed by the replan interval.
    pub(crate) fn request_move_target(&mut self, target_ref: PolyRef, pos: Vec3) {
        self.target_ref = target_ref;
        self.target_pos = pos;
        self.path_queue_ref = None;
        self.request_age = 0.0;
        self.target_moved = false;
        self.state = if target_ref.is_valid() {
            MoveRequestState::Requesting
        } else {
            MoveRequestState::Failed
        };
    }

    /// Drops the current request. Returns the pending queue request, if
    /// any, so the caller can cancel it.
    pub(crate) fn reset_move_target(&mut self) -> Option<PathQueueRef> {
        self.target_ref = PolyRef::NULL;
        self.target_pos = Vec3::ZERO;
        self.state = MoveRequestState::None;
        self.target_moved = false;
        self.corners.clear();
        self.path_queue_ref.take()
    }

    pub(crate) fn request_move_velocity(&mut self, vel: Vec3) -> Option<PathQueueRef> {
        let pending = self.reset_move_target();
        self.target_pos = vel;
        self.state = MoveRequestState::Velocity;
        pending
    }

    /// Moves the target a short distance. Slides the corridor end along
    /// the surface when the path is valid, replans otherwise.
    ///
    /// An active request replans at most once per `replan_interval`; a
    /// target moved before that is picked up by `check_path_validity`.
    pub(crate) fn adjust_move_target(
        &mut self,
        target_ref: PolyRef,
        pos: Vec3,
        corridor: &mut PathCorridor,
        nav: &NavQueryContext,
    ) {
        if self.state == MoveRequestState::Valid && corridor.move_target_position(pos, nav) {
            self.target_ref = corridor.last_poly();
            self.target_pos = corridor.target();
            return;
        }
        let active = matches!(
            self.state,
            MoveRequestState::Valid
                | MoveRequestState::Requesting
                | MoveRequestState::WaitingForQueue
                | MoveRequestState::WaitingForPath
        );
        if active && target_ref.is_valid() && self.request_age < self.replan_interval {
            self.target_ref = target_ref;
            self.target_pos = pos;
            // Searches not started yet use the new target as is
            self.target_moved |= matches!(
                self.state,
                MoveRequestState::Valid | MoveRequestState::WaitingForPath
            );
            return;
        }
        self.request_move_target(target_ref, pos);
    }

    /// Repairs the corridor and target and decides whether to replan.
    ///
    /// Fails with `CorridorDesync` when the agent is no longer near any
    /// polygon; the corridor is cleared in that case.
    pub(crate) fn check_path_validity(
        &mut self,
        agent_id: usize,
        corridor: &mut PathCorridor,
        boundary: &mut LocalBoundary,
        nav: &NavQueryContext,
        dt: f32,
    ) -> Result<()> {
        self.replan_time += dt;
        self.request_age += dt;

        let mut replan = false;

        // First check that the current location is valid
        let mut agent_pos = corridor.pos();
        let mut agent_ref = corridor.first_poly();
        if !nav.is_valid(agent_ref) {
            // Current location is not valid, try to reposition
            let Some((safe_ref, safe_pos)) = nav.find_nearest(agent_pos) else {
                corridor.reset(PolyRef::NULL, agent_pos);
                boundary.reset();
                return Err(Error::CorridorDesync(format!(
                    "agent {} is off the mesh at {:?}",
                    agent_id, agent_pos
                )));
            };
            corridor.fix_path_start(safe_ref, safe_pos);
            boundary.reset();
            agent_ref = safe_ref;
            agent_pos = safe_pos;
            replan = true;
        }

        // No target to recover or replan
        if matches!(self.state, MoveRequestState::None | MoveRequestState::Velocity) {
            if replan {
                corridor.reset(agent_ref, agent_pos);
            }
            return Ok(());
        }

        // Try to recover move request position
        if self.state != MoveRequestState::Failed && !nav.is_valid(self.target_ref) {
            match nav.find_nearest(self.target_pos) {
                Some((r, p)) => {
                    self.target_ref = r;
                    self.target_pos = p;
                    replan = true;
                }
                None => {
                    // Failed to reposition target, fail the request
                    debug!("Agent {} lost its target", agent_id);
                    corridor.reset(agent_ref, agent_pos);
                    self.target_ref = PolyRef::NULL;
                    self.path_queue_ref = None;
                    self.state = MoveRequestState::None;
                    return Ok(());
                }
            }
        }

        // If nearby corridor is not valid, replan
        if !corridor.is_valid(CHECK_LOOKAHEAD, nav) {
            replan = true;
        }

        // If the end of the path is near and it is not the requested location, replan
        if self.state == MoveRequestState::Valid
            && self.replan_time > self.replan_interval
            && corridor.path_count() < CHECK_LOOKAHEAD
            && corridor.last_poly() != self.target_ref
        {
            replan = true;
        }

        if self.state == MoveRequestState::Valid && self.target_moved {
            replan = true;
        }

        // Retry a failed request
        if self.state == MoveRequestState::Failed
            && self.target_ref.is_valid()
            && self.replan_time > self.replan_interval
        {
            replan = true;
        }

        if replan {
            if self.request_age >= self.replan_interval {
                debug!("Agent {} replanning", agent_id);
                self.request_move_target(self.target_ref, self.target_pos);
            } else {
                // Keep what is still usable until the next replan is allowed
                corridor.trim_invalid_path(agent_ref, agent_pos, nav);
            }
        }
        Ok(())
    }

    /// Runs a short search for a fresh request. Agents whose target was
    /// not reached move on to the path queue.
    pub(crate) fn update_quick_search(
        &mut self,
        corridor: &mut PathCorridor,
        boundary: &mut LocalBoundary,
        nav: &NavQueryContext,
    ) {
        if self.state != MoveRequestState::Requesting {
            return;
        }
        let start = corridor.first_poly();
        let agent_pos = corridor.pos();
        if !start.is_valid() {
            self.state = MoveRequestState::Failed;
            return;
        }

        // Quick search towards the goal
        let mut req_path = nav
            .query()
            .find_path(
                start,
                self.target_ref,
                agent_pos,
                self.target_pos,
                nav.filter(),
                MAX_QUICK_SEARCH_RES,
            )
            .unwrap_or_default();

        let mut req_pos = self.target_pos;
        if let Some(&last) = req_path.last() {
            if last != self.target_ref {
                // Partial path, constrain target position inside the last polygon
                match nav.query().closest_point_on_poly(last, self.target_pos) {
                    Ok(p) => req_pos = p,
                    Err(_) => req_path.clear(),
                }
            }
        }

        if req_path.is_empty() {
            // Keep walking the old corridor while the full search runs
            self.state = MoveRequestState::WaitingForQueue;
            return;
        }

        corridor.set_corridor(req_pos, &req_path);
        boundary.reset();

        if req_path.last() == Some(&self.target_ref) {
            self.state = MoveRequestState::Valid;
            self.replan_time = 0.0;
        } else {
            // The path is longer or potentially unreachable, full plan
            self.state = MoveRequestState::WaitingForQueue;
        }
    }

    /// Queues a full search from the corridor end. Returns false if the
    /// queue is full.
    pub(crate) fn enqueue(&mut self, corridor: &PathCorridor, queue: &mut PathQueue, nav: &NavQueryContext) -> bool {
        if self.state != MoveRequestState::WaitingForQueue {
            return false;
        }
        match queue.request(
            corridor.last_poly(),
            self.target_ref,
            corridor.target(),
            self.target_pos,
            nav.filter(),
        ) {
            Some(handle) => {
                self.path_queue_ref = Some(handle);
                self.state = MoveRequestState::WaitingForPath;
                true
            }
            None => false,
        }
    }

    /// Picks up a finished queued search and splices it onto the corridor.
    ///
    /// Returns `NoPathFound` when the search failed or its result could not
    /// be merged; the corridor is left as it was.
    pub(crate) fn poll_path_queue(
        &mut self,
        corridor: &mut PathCorridor,
        boundary: &mut LocalBoundary,
        queue: &mut PathQueue,
        nav: &NavQueryContext,
    ) -> Result<()> {
        if self.state != MoveRequestState::WaitingForPath {
            return Ok(());
        }
        let Some(handle) = self.path_queue_ref else {
            self.state = MoveRequestState::Requesting;
            return Ok(());
        };

        match queue.request_status(handle) {
            PathQueueStatus::Working => return Ok(()),
            PathQueueStatus::Invalid => {
                // Expired, ask again
                self.path_queue_ref = None;
                self.state = MoveRequestState::Requesting;
                self.replan_time = 0.0;
                return Ok(());
            }
            PathQueueStatus::Success | PathQueueStatus::Failure => {}
        }

        self.path_queue_ref = None;
        self.replan_time = 0.0;
        let result = match queue.take_path_result(handle) {
            Ok(res) => res,
            Err(err) => {
                self.state = MoveRequestState::Failed;
                return Err(err);
            }
        };

        let path = corridor.path();
        let Some(&path_last) = path.last() else {
            self.state = MoveRequestState::Failed;
            return Err(Error::NoPathFound("empty corridor".into()));
        };

        // The result must continue from the current path end
        if result.path.first() != Some(&path_last) {
            self.state = MoveRequestState::Failed;
            return Err(Error::NoPathFound(
                "path result does not start at the corridor end".into(),
            ));
        }

        // Put the old path in front of the new one
        let mut merged: Vec<PolyRef> = path[..path.len() - 1].to_vec();
        merged.extend_from_slice(&result.path);
        remove_trackbacks(&mut merged);

        let mut target_pos = self.target_pos;
        if merged.last() != Some(&self.target_ref) {
            // Partial path, constrain target position inside the last polygon
            let last = merged.last().copied().unwrap_or_default();
            match nav.query().closest_point_on_poly(last, target_pos) {
                Ok(p) => target_pos = p,
                Err(err) => {
                    self.state = MoveRequestState::Failed;
                    return Err(err);
                }
            }
        }

        corridor.set_corridor(target_pos, &merged);
        // Force to update boundary
        boundary.reset();
        self.state = MoveRequestState::Valid;
        Ok(())
    }

    /// Advances the topology timer. Returns true when this agent is due
    /// for an optimization.
    pub(crate) fn tick_topology(&mut self, dt: f32) -> bool {
        if matches!(self.state, MoveRequestState::None | MoveRequestState::Velocity) {
            return false;
        }
        self.topology_opt_time += dt;
        self.topology_opt_time >= OPT_TIME_THR
    }

    pub(crate) fn optimize_topology(&mut self, corridor: &mut PathCorridor, nav: &NavQueryContext) {
        corridor.optimize_path_topology(nav);
        self.topology_opt_time = 0.0;
    }

    /// Steers along the corridor
    pub(crate) fn evaluate(&mut self, ctx: &SteeringContext, frame: &mut SteeringFrame) -> SteeringOutput {
        match self.state {
            MoveRequestState::None => {
                self.corners.clear();
                return SteeringOutput::new(Vec3::ZERO);
            }
            MoveRequestState::Velocity => {
                self.corners.clear();
                let vel = Vec3::new(self.target_pos.x, 0.0, self.target_pos.z);
                return SteeringOutput::new(clamp_length(&vel, ctx.params.max_speed));
            }
            _ => {}
        }

        let pos = ctx.agent.pos;
        let params = ctx.params;

        // Find corners for steering
        self.corners = match frame.corridor.find_corners(MAX_CORNERS, ctx.nav) {
            Ok(corners) => corners,
            Err(err) => {
                frame.recovered.push(err);
                Vec::new()
            }
        };

        // Check to see if the corner after the next corner is directly
        // visible, and short cut to there
        if params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) {
            if let Some(next) = self.corners.get(1).or(self.corners.first()) {
                let range = self
                    .path_optimization_range
                    .unwrap_or(params.path_optimization_range);
                frame.corridor.optimize_path_visibility(next.pos, range, ctx.nav);
            }
        }

        // Trigger off-mesh connections when close enough
        if let Some(last) = self.corners.last() {
            let trigger_radius = params.radius * 2.25;
            if last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                && dist_sqr_2d(&pos, &last.pos) < trigger_radius * trigger_radius
            {
                match frame.corridor.move_over_offmesh_connection(last.poly, ctx.nav) {
                    Ok((start, end)) => {
                        self.corners.clear();
                        frame.offmesh = Some(OffMeshTrigger { start, end });
                        return SteeringOutput::halt(Vec3::ZERO);
                    }
                    Err(err) => {
                        warn!("Agent {} could not enter off-mesh connection: {}", ctx.agent.id, err);
                        frame.recovered.push(err);
                    }
                }
            }
        }

        if self.corners.is_empty() {
            return SteeringOutput::new(Vec3::ZERO);
        }

        let dir = if params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
            calc_smooth_steer_direction(pos, &self.corners)
        } else {
            calc_straight_steer_direction(pos, &self.corners)
        };

        // Calculate speed scale, which tells the agent to slow down at the end of the path
        let slow_down_radius = params.radius * 2.0;
        let speed_scale = if slow_down_radius > 0.0 {
            distance_to_goal(pos, &self.corners, slow_down_radius) / slow_down_radius
        } else {
            1.0
        };

        SteeringOutput::new(dir * (params.max_speed * speed_scale))
    }
}

/// Removes `a, b, a` detours from a merged path
fn remove_trackbacks(path: &mut Vec<PolyRef>) {
    let mut j = 1;
    while j + 1 < path.len() {
        if path[j - 1] == path[j + 1] {
            path.drain(j - 1..j + 1);
            j = (j - 1).max(1);
        } else {
            j += 1;
        }
    }
}

fn calc_smooth_steer_direction(pos: Vec3, corners: &[StraightPathPoint]) -> Vec3 {
    let ip1 = 1.min(corners.len() - 1);
    let p0 = corners[0].pos;
    let p1 = corners[ip1].pos;

    let dir0 = Vec3::new(p0.x - pos.x, 0.0, p0.z - pos.z);
    let mut dir1 = Vec3::new(p1.x - pos.x, 0.0, p1.z - pos.z);

    let len0 = length_2d(&dir0);
    let len1 = length_2d(&dir1);
    if len1 > 0.001 {
        dir1 /= len1;
    }

    normalize_2d(&(dir0 - dir1 * (len0 * 0.5)))
}

fn calc_straight_steer_direction(pos: Vec3, corners: &[StraightPathPoint]) -> Vec3 {
    normalize_2d(&(corners[0].pos - pos))
}

/// Distance to the end of the path, capped at `range` when the end is not
/// among the corners yet
fn distance_to_goal(pos: Vec3, corners: &[StraightPathPoint], range: f32) -> f32 {
    match corners.last() {
        Some(end) if end.flags.contains(StraightPathFlags::END) => dist_2d(&pos, &end.pos).min(range),
        _ => range,
    }
}
