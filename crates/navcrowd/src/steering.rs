//! Steering behaviours
//!
//! A behaviour turns an agent's surroundings into a velocity for one tick.
//! Behaviours are plain data: every variant of [`SteeringBehavior`] carries
//! its own parameter block and whatever runtime state it needs, and the
//! agent's [`BehaviorPipeline`](crate::BehaviorPipeline) owns them.
//!
//! Each behaviour type declares how its output combines with the velocity
//! computed by the nodes before it, see [`CombineMode`].

use navcrowd_common::{Error, Result, Vec3, clamp_length, dist_2d, length_2d, normalize_2d};

use crate::collision_avoidance::CollisionAvoidance;
use crate::environment::{AgentSnapshot, Environment};
use crate::path_corridor::PathCorridor;
use crate::path_following::PathFollowing;
use crate::{AgentId, AgentParams, CrowdAgentState, NavQueryContext, UpdateFlags};

/// Speeds and distances below this are treated as zero
pub(crate) const EPSILON: f32 = 1e-4;

/// How a behaviour's output is combined with the running desired velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// The output replaces the desired velocity
    Override,
    /// The output is a force, applied over the tick within the agent's
    /// acceleration and speed limits
    Accumulate,
}

/// Result of evaluating one behaviour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteeringOutput {
    pub velocity: Vec3,
    /// Skip the remaining behaviours of the pipeline this tick
    pub halt: bool,
}

impl SteeringOutput {
    pub fn new(velocity: Vec3) -> Self {
        Self { velocity, halt: false }
    }

    pub fn halt(velocity: Vec3) -> Self {
        Self { velocity, halt: true }
    }
}

/// Off-mesh connection an agent has just stepped onto
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffMeshTrigger {
    pub start: Vec3,
    pub end: Vec3,
}

/// Read-only inputs of a behaviour evaluation
///
/// Everything here comes from the pre-tick snapshot and is shared by all
/// agents.
#[derive(Debug, Clone, Copy)]
pub struct SteeringContext<'s, 'n> {
    pub agent: &'s AgentSnapshot,
    pub params: &'s AgentParams,
    pub env: &'s Environment,
    pub snapshots: &'s [Option<AgentSnapshot>],
    pub nav: &'s NavQueryContext<'n>,
    pub dt: f32,
}

impl<'s> SteeringContext<'s, '_> {
    /// Another agent's snapshot, if it exists and is on the mesh
    pub fn other(&self, id: AgentId) -> Option<&'s AgentSnapshot> {
        if id == self.agent.id {
            return None;
        }
        self.snapshots
            .get(id)
            .and_then(Option::as_ref)
            .filter(|s| s.state != CrowdAgentState::Invalid)
    }

    /// Snapshots of the listed agents, skipping unknown ones and the agent
    /// itself
    pub fn targets<'t>(&self, ids: &'t [AgentId]) -> impl Iterator<Item = &'s AgentSnapshot> {
        let ctx = *self;
        ids.iter().filter_map(move |&id| ctx.other(id))
    }
}

/// State owned by the evaluated agent that behaviours may change
#[derive(Debug)]
pub struct SteeringFrame<'f> {
    pub corridor: &'f mut PathCorridor,
    /// Set when the agent should start traversing an off-mesh connection
    pub offmesh: Option<OffMeshTrigger>,
    /// Failures recovered during evaluation
    pub recovered: Vec<Error>,
}

impl<'f> SteeringFrame<'f> {
    pub fn new(corridor: &'f mut PathCorridor) -> Self {
        Self {
            corridor,
            offmesh: None,
            recovered: Vec::new(),
        }
    }
}

/// One node of a behaviour pipeline
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(tag = "type"))]
pub enum SteeringBehavior {
    PathFollowing(PathFollowing),
    CollisionAvoidance(CollisionAvoidance),
    Seek(Seek),
    Arrive(Arrive),
    Separation(Separation),
    Alignment(Alignment),
    Cohesion(Cohesion),
    Flocking(Flocking),
}

impl SteeringBehavior {
    /// How the output of this behaviour type is combined
    pub fn combine_mode(&self) -> CombineMode {
        match self {
            Self::PathFollowing(_)
            | Self::CollisionAvoidance(_)
            | Self::Seek(_)
            | Self::Arrive(_) => CombineMode::Override,
            Self::Separation(_) | Self::Alignment(_) | Self::Cohesion(_) | Self::Flocking(_) => {
                CombineMode::Accumulate
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PathFollowing(_) => "PathFollowing",
            Self::CollisionAvoidance(_) => "CollisionAvoidance",
            Self::Seek(_) => "Seek",
            Self::Arrive(_) => "Arrive",
            Self::Separation(_) => "Separation",
            Self::Alignment(_) => "Alignment",
            Self::Cohesion(_) => "Cohesion",
            Self::Flocking(_) => "Flocking",
        }
    }

    /// Evaluates the behaviour. `dvel` is the desired velocity computed by
    /// the preceding nodes.
    pub fn evaluate(
        &mut self,
        dvel: Vec3,
        ctx: &SteeringContext,
        frame: &mut SteeringFrame,
    ) -> SteeringOutput {
        match self {
            Self::PathFollowing(b) => b.evaluate(ctx, frame),
            Self::CollisionAvoidance(b) => b.evaluate(dvel, ctx, frame),
            Self::Seek(b) => b.evaluate(dvel, ctx),
            Self::Arrive(b) => b.evaluate(ctx),
            Self::Separation(b) => SteeringOutput::new(b.compute_force(ctx)),
            Self::Alignment(b) => SteeringOutput::new(b.compute_force(ctx)),
            Self::Cohesion(b) => SteeringOutput::new(b.compute_force(ctx)),
            Self::Flocking(b) => SteeringOutput::new(b.compute_force(ctx)),
        }
    }

    /// Checks the parameter block
    pub fn validate(&self) -> Result<()> {
        let finite = |name: &str, v: f32| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(Error::InvalidParam(format!("{} must be finite, got {}", name, v)))
            }
        };
        match self {
            Self::PathFollowing(b) => b.validate(),
            Self::CollisionAvoidance(b) => b.params.validate(),
            Self::Seek(b) => {
                finite("distance", b.distance)?;
                finite("prediction_factor", b.prediction_factor)
            }
            Self::Arrive(b) => finite("distance", b.distance),
            Self::Separation(b) => finite("weight", b.weight),
            Self::Alignment(_) | Self::Cohesion(_) => Ok(()),
            Self::Flocking(b) => {
                finite("separation_weight", b.separation_weight)?;
                finite("alignment_weight", b.alignment_weight)?;
                finite("cohesion_weight", b.cohesion_weight)
            }
        }
    }
}

/// Applies `force` to the running desired velocity for one tick
pub(crate) fn apply_force(dvel: Vec3, force: Vec3, params: &AgentParams, dt: f32) -> Vec3 {
    let force = clamp_length(&force, params.max_acceleration);
    let v = dvel + force * dt;
    if length_2d(&v) < EPSILON {
        return Vec3::ZERO;
    }
    clamp_length(&v, params.max_speed)
}

/// Accelerates towards `aim` and brakes so the agent stops once
/// `dist_to_obj` reaches zero.
fn steer_towards(ctx: &SteeringContext, aim: Vec3, dist_to_obj: f32) -> Vec3 {
    // Reached the target
    if dist_to_obj <= EPSILON {
        return Vec3::ZERO;
    }

    let agent = ctx.agent;
    let max_accel = ctx.params.max_acceleration;
    let dir = normalize_2d(&(aim - agent.pos));
    let mut v = Vec3::new(agent.vel.x, 0.0, agent.vel.z) + dir * (max_accel * ctx.dt);

    // Distance needed to reach nil speed with the current acceleration
    let speed = length_2d(&agent.vel);
    let slow_dist = speed * speed / max_accel;
    if dist_to_obj < slow_dist {
        v *= dist_to_obj / slow_dist;
    }
    clamp_length(&v, ctx.params.max_speed)
}

/// What a [`Seek`] pursues
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum SeekTarget {
    /// Another agent, extrapolated by its velocity
    Agent(AgentId),
    Point(Vec3),
}

impl Default for SeekTarget {
    fn default() -> Self {
        Self::Point(Vec3::ZERO)
    }
}

/// Pursues a point or another agent's predicted position
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Seek {
    pub target: SeekTarget,
    /// Minimal distance kept between the two agents' edges
    pub distance: f32,
    /// Seconds of target motion to extrapolate
    pub prediction_factor: f32,
}

impl Default for Seek {
    fn default() -> Self {
        Self {
            target: SeekTarget::default(),
            distance: 0.0,
            prediction_factor: 0.0,
        }
    }
}

impl Seek {
    pub fn new(target: SeekTarget) -> Self {
        Self { target, ..Default::default() }
    }

    fn evaluate(&self, dvel: Vec3, ctx: &SteeringContext) -> SteeringOutput {
        let (pos, vel, radius) = match self.target {
            SeekTarget::Agent(id) => match ctx.other(id) {
                Some(t) => (t.pos, t.vel, t.radius),
                // Lost target, leave the velocity as it is
                None => return SteeringOutput::new(dvel),
            },
            SeekTarget::Point(p) => (p, Vec3::ZERO, 0.0),
        };
        let aim = pos + vel * self.prediction_factor;
        let dist_to_obj = dist_2d(&ctx.agent.pos, &pos) - ctx.params.radius - radius - self.distance;
        SteeringOutput::new(steer_towards(ctx, aim, dist_to_obj))
    }
}

/// Moves to a point and stops `distance` short of it
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Arrive {
    pub target: Vec3,
    pub distance: f32,
}

impl Arrive {
    pub fn new(target: Vec3) -> Self {
        Self { target, distance: 0.0 }
    }

    fn evaluate(&self, ctx: &SteeringContext) -> SteeringOutput {
        let dist_to_obj = dist_2d(&ctx.agent.pos, &self.target) - self.distance;
        SteeringOutput::new(steer_towards(ctx, self.target, dist_to_obj))
    }
}

/// Pushes away from the listed agents, harder the closer they are
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Separation {
    pub targets: Vec<AgentId>,
    /// Edge distance beyond which targets are ignored, defaults to the
    /// agent's collision query range
    pub distance: Option<f32>,
    pub weight: f32,
}

impl Default for Separation {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            distance: None,
            weight: 1.0,
        }
    }
}

impl Separation {
    pub fn new(targets: Vec<AgentId>) -> Self {
        Self { targets, ..Default::default() }
    }

    fn compute_force(&self, ctx: &SteeringContext) -> Vec3 {
        if !ctx.params.update_flags.contains(UpdateFlags::SEPARATION) {
            return Vec3::ZERO;
        }
        separation_force(ctx, &self.targets, self.distance) * self.weight
    }
}

fn separation_force(ctx: &SteeringContext, targets: &[AgentId], distance: Option<f32>) -> Vec3 {
    let max_dist = distance.unwrap_or(ctx.params.collision_query_range);
    if max_dist <= 0.0 {
        return Vec3::ZERO;
    }
    let inv_max_dist = 1.0 / max_dist;

    let mut force = Vec3::ZERO;
    let mut count = 0;
    for target in ctx.targets(targets) {
        let diff = ctx.agent.pos - target.pos;
        let dist = length_2d(&diff) - ctx.params.radius - target.radius;
        if dist > max_dist || dist < EPSILON {
            continue;
        }
        let weight = 1.0 - (dist * inv_max_dist).powi(2);
        force += normalize_2d(&diff) * (weight / dist);
        count += 1;
    }

    if count > 0 { force / count as f32 } else { force }
}

/// Matches the average velocity of the listed agents
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Alignment {
    pub targets: Vec<AgentId>,
}

impl Alignment {
    pub fn new(targets: Vec<AgentId>) -> Self {
        Self { targets }
    }

    fn compute_force(&self, ctx: &SteeringContext) -> Vec3 {
        alignment_force(ctx, &self.targets)
    }
}

fn alignment_force(ctx: &SteeringContext, targets: &[AgentId]) -> Vec3 {
    let (sum, count) = ctx
        .targets(targets)
        .fold((Vec3::ZERO, 0), |(sum, n), t| (sum + t.vel, n + 1));
    if count == 0 {
        return Vec3::ZERO;
    }
    let avg = sum / count as f32;
    Vec3::new(avg.x - ctx.agent.vel.x, 0.0, avg.z - ctx.agent.vel.z)
}

/// Steers towards the centroid of the listed agents
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Cohesion {
    pub targets: Vec<AgentId>,
}

impl Cohesion {
    pub fn new(targets: Vec<AgentId>) -> Self {
        Self { targets }
    }

    fn compute_force(&self, ctx: &SteeringContext) -> Vec3 {
        cohesion_force(ctx, &self.targets)
    }
}

fn cohesion_force(ctx: &SteeringContext, targets: &[AgentId]) -> Vec3 {
    let (sum, count) = ctx
        .targets(targets)
        .fold((Vec3::ZERO, 0), |(sum, n), t| (sum + t.pos, n + 1));
    if count == 0 {
        return Vec3::ZERO;
    }
    let center = sum / count as f32;
    Vec3::new(center.x - ctx.agent.pos.x, 0.0, center.z - ctx.agent.pos.z)
}

/// Separation, alignment and cohesion over the same set of agents
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct Flocking {
    pub to_flock_with: Vec<AgentId>,
    /// See [`Separation::distance`]
    pub separation_distance: Option<f32>,
    pub separation_weight: f32,
    pub alignment_weight: f32,
    pub cohesion_weight: f32,
}

impl Default for Flocking {
    fn default() -> Self {
        Self {
            to_flock_with: Vec::new(),
            separation_distance: None,
            separation_weight: 2.0,
            alignment_weight: 1.0,
            cohesion_weight: 1.0,
        }
    }
}

impl Flocking {
    pub fn new(to_flock_with: Vec<AgentId>) -> Self {
        Self { to_flock_with, ..Default::default() }
    }

    fn compute_force(&self, ctx: &SteeringContext) -> Vec3 {
        let mut force = Vec3::ZERO;
        if ctx.params.update_flags.contains(UpdateFlags::SEPARATION) {
            force += separation_force(ctx, &self.to_flock_with, self.separation_distance)
                * self.separation_weight;
        }
        force += alignment_force(ctx, &self.to_flock_with) * self.alignment_weight;
        force += cohesion_force(ctx, &self.to_flock_with) * self.cohesion_weight;
        force
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::PolyMeshQuery;
    use navcrowd_query::test_mesh_helpers::create_square_mesh;

    fn snap(id: AgentId, pos: Vec3, vel: Vec3) -> Option<AgentSnapshot> {
        Some(AgentSnapshot {
            id,
            pos,
            vel,
            dvel: vel,
            radius: 0.5,
            height: 2.0,
            state: CrowdAgentState::Walking,
        })
    }

    fn params() -> AgentParams {
        AgentParams {
            radius: 0.5,
            max_speed: 2.0,
            max_acceleration: 8.0,
            collision_query_range: 4.0,
            ..Default::default()
        }
    }

    /// Runs `f` with a context for agent 0 of `snaps`
    fn with_ctx<R>(snaps: &[Option<AgentSnapshot>], f: impl FnOnce(&SteeringContext) -> R) -> Result<R> {
        let mesh = create_square_mesh(10.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let params = params();
        let env = Environment::new();
        let agent = snaps[0].expect("agent 0");
        let ctx = SteeringContext {
            agent: &agent,
            params: &params,
            env: &env,
            snapshots: snaps,
            nav: &nav,
            dt: 0.1,
        };
        Ok(f(&ctx))
    }

    #[test]
    fn test_combine_modes() {
        assert_eq!(
            SteeringBehavior::Seek(Seek::default()).combine_mode(),
            CombineMode::Override
        );
        assert_eq!(
            SteeringBehavior::CollisionAvoidance(CollisionAvoidance::default()).combine_mode(),
            CombineMode::Override
        );
        assert_eq!(
            SteeringBehavior::Flocking(Flocking::default()).combine_mode(),
            CombineMode::Accumulate
        );
        assert_eq!(
            SteeringBehavior::Cohesion(Cohesion::default()).combine_mode(),
            CombineMode::Accumulate
        );
    }

    #[test]
    fn test_arrive_accelerates_then_stops() -> Result<()> {
        let snaps = vec![snap(0, Vec3::ZERO, Vec3::ZERO)];
        let v = with_ctx(&snaps, |ctx| Arrive::new(Vec3::new(5.0, 0.0, 0.0)).evaluate(ctx))?;
        // One tick of full acceleration from rest
        assert!((v.velocity - Vec3::new(0.8, 0.0, 0.0)).length() < 1e-5);

        let v = with_ctx(&snaps, |ctx| {
            Arrive { target: Vec3::new(1.0, 0.0, 0.0), distance: 1.0 }.evaluate(ctx)
        })?;
        assert_eq!(v.velocity, Vec3::ZERO);
        Ok(())
    }

    #[test]
    fn test_arrive_brakes_inside_slow_distance() -> Result<()> {
        // Moving at 2 with accel 8 needs 0.5 to stop
        let snaps = vec![snap(0, Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0))];
        let v = with_ctx(&snaps, |ctx| Arrive::new(Vec3::new(0.25, 0.0, 0.0)).evaluate(ctx))?;
        assert!(v.velocity.x > 0.0);
        assert!(v.velocity.x < 2.0);
        Ok(())
    }

    #[test]
    fn test_seek_predicts_target_motion() -> Result<()> {
        let snaps = vec![
            snap(0, Vec3::ZERO, Vec3::ZERO),
            snap(1, Vec3::new(5.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 5.0)),
        ];
        let seek = Seek {
            target: SeekTarget::Agent(1),
            distance: 0.0,
            prediction_factor: 1.0,
        };
        let out = with_ctx(&snaps, |ctx| seek.evaluate(Vec3::ZERO, ctx))?;
        // Aims at (5, 0, 5)
        assert!((out.velocity.x - out.velocity.z).abs() < 1e-5);
        assert!(out.velocity.x > 0.0);

        // A missing target leaves the incoming velocity alone
        let lost = Seek::new(SeekTarget::Agent(7));
        let dvel = Vec3::new(0.3, 0.0, 0.1);
        let out = with_ctx(&snaps, |ctx| lost.evaluate(dvel, ctx))?;
        assert_eq!(out.velocity, dvel);
        Ok(())
    }

    #[test]
    fn test_separation_pushes_away() -> Result<()> {
        let snaps = vec![
            snap(0, Vec3::ZERO, Vec3::ZERO),
            snap(1, Vec3::new(2.0, 0.0, 0.0), Vec3::ZERO),
            // Beyond the separation distance
            snap(2, Vec3::new(0.0, 0.0, 9.0), Vec3::ZERO),
        ];
        let sep = Separation::new(vec![1, 2]);
        let f = with_ctx(&snaps, |ctx| sep.compute_force(ctx))?;
        // dist = 1, weight = 1 - (1/4)^2
        assert!((f.x + 0.9375).abs() < 1e-5);
        assert!(f.z.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_alignment_and_cohesion() -> Result<()> {
        let snaps = vec![
            snap(0, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)),
            snap(1, Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)),
            snap(2, Vec3::new(0.0, 0.0, 2.0), Vec3::new(0.0, 0.0, 3.0)),
        ];
        let a = with_ctx(&snaps, |ctx| Alignment::new(vec![1, 2]).compute_force(ctx))?;
        assert!((a - Vec3::new(-1.0, 0.0, 2.0)).length() < 1e-5);

        let c = with_ctx(&snaps, |ctx| Cohesion::new(vec![0, 1, 2]).compute_force(ctx))?;
        // The agent itself is not part of the centroid
        assert!((c - Vec3::new(1.0, 0.0, 1.0)).length() < 1e-5);

        let none = with_ctx(&snaps, |ctx| Cohesion::new(vec![]).compute_force(ctx))?;
        assert_eq!(none, Vec3::ZERO);
        Ok(())
    }

    #[test]
    fn test_flocking_is_weighted_sum() -> Result<()> {
        let snaps = vec![
            snap(0, Vec3::ZERO, Vec3::ZERO),
            snap(1, Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)),
        ];
        let flock = Flocking::new(vec![1]);
        let (total, sep, ali, coh) = with_ctx(&snaps, |ctx| {
            (
                flock.compute_force(ctx),
                separation_force(ctx, &[1], None),
                alignment_force(ctx, &[1]),
                cohesion_force(ctx, &[1]),
            )
        })?;
        let expected = sep * 2.0 + ali + coh;
        assert!((total - expected).length() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_apply_force_limits() {
        let p = params();
        // Force clamped to max acceleration
        let v = apply_force(Vec3::ZERO, Vec3::new(100.0, 0.0, 0.0), &p, 0.1);
        assert!((v.x - 0.8).abs() < 1e-5);
        // Speed clamped to max speed
        let v = apply_force(Vec3::new(2.0, 0.0, 0.0), Vec3::new(8.0, 0.0, 0.0), &p, 1.0);
        assert!((v.length() - 2.0).abs() < 1e-5);
        // Tiny results snap to rest
        let v = apply_force(Vec3::new(1e-5, 0.0, 0.0), Vec3::ZERO, &p, 0.1);
        assert_eq!(v, Vec3::ZERO);
    }

    #[test]
    fn test_validate_rejects_nan() {
        let bad = SteeringBehavior::Arrive(Arrive { target: Vec3::ZERO, distance: f32::NAN });
        assert!(matches!(bad.validate(), Err(Error::InvalidParam(_))));
        assert!(SteeringBehavior::Flocking(Flocking::default()).validate().is_ok());
    }
}
