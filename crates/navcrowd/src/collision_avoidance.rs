//! Collision avoidance pipeline node
//!
//! Feeds the agent's neighbours and the walls facing it into the velocity
//! obstacle solver and replaces the desired velocity with the solver's
//! answer.

use log::warn;
use navcrowd_common::{Vec3, tri_area_2d};

use crate::obstacle_avoidance::{
    ObstacleAvoidanceDebugData, ObstacleAvoidanceParams, ObstacleAvoidanceQuery,
};
use crate::steering::{SteeringContext, SteeringFrame, SteeringOutput};
use crate::UpdateFlags;

/// Upper bound on recorded debug samples
const MAX_DEBUG_SAMPLES: usize = 512;

/// How candidate velocities are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum AvoidanceSampling {
    /// Concentric rings refined around the best candidate
    #[default]
    Adaptive,
    /// A regular grid over the velocity disc
    Grid,
}

/// Resolves the desired velocity into a collision free one
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct CollisionAvoidance {
    pub params: ObstacleAvoidanceParams,
    pub sampling: AvoidanceSampling,
    /// Keep the scored samples of the last solve
    pub debug: bool,
    #[cfg_attr(feature = "serialization", serde(skip))]
    query: ObstacleAvoidanceQuery,
    #[cfg_attr(feature = "serialization", serde(skip))]
    debug_data: Option<ObstacleAvoidanceDebugData>,
}

impl CollisionAvoidance {
    pub fn new(params: ObstacleAvoidanceParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn with_sampling(mut self, sampling: AvoidanceSampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Samples of the last solve, if `debug` is set
    pub fn debug_data(&self) -> Option<&ObstacleAvoidanceDebugData> {
        self.debug_data.as_ref()
    }

    pub(crate) fn evaluate(
        &mut self,
        dvel: Vec3,
        ctx: &SteeringContext,
        frame: &mut SteeringFrame,
    ) -> SteeringOutput {
        if !ctx.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
            return SteeringOutput::new(dvel);
        }

        let agent = ctx.agent;
        self.query.reset();

        // Add neighbours as obstacles
        for nei in ctx.env.neighbours() {
            if let Some(other) = ctx.other(nei.agent) {
                self.query.add_circle(other.pos, other.radius, other.vel, other.dvel);
            }
        }

        // Append neighbour segments as obstacles, ignoring the ones behind
        for &(s0, s1) in ctx.env.walls() {
            if tri_area_2d(&agent.pos, &s0, &s1) < 0.0 {
                continue;
            }
            self.query.add_segment(s0, s1);
        }

        let debug = if self.debug {
            Some(
                self.debug_data
                    .get_or_insert_with(|| ObstacleAvoidanceDebugData::new(MAX_DEBUG_SAMPLES)),
            )
        } else {
            None
        };

        let result = match self.sampling {
            AvoidanceSampling::Adaptive => self.query.sample_velocity_adaptive(
                agent.pos,
                ctx.params.radius,
                ctx.params.max_speed,
                agent.vel,
                dvel,
                &self.params,
                debug,
            ),
            AvoidanceSampling::Grid => self.query.sample_velocity_grid(
                agent.pos,
                ctx.params.radius,
                ctx.params.max_speed,
                agent.vel,
                dvel,
                &self.params,
                debug,
            ),
        };

        match result {
            Ok((vel, _)) => SteeringOutput::new(vel),
            Err(err) => {
                // Safe stop
                warn!("Agent {} avoidance failed: {}", agent.id, err);
                frame.recovered.push(err);
                SteeringOutput::new(Vec3::ZERO)
            }
        }
    }
}
