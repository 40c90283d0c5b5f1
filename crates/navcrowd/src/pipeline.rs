//! Ordered composition of steering behaviours

use navcrowd_common::{Result, Vec3};

use crate::collision_avoidance::CollisionAvoidance;
use crate::path_following::PathFollowing;
use crate::steering::{
    CombineMode, SteeringBehavior, SteeringContext, SteeringFrame, apply_force,
};

/// An agent's behaviours, evaluated in order every tick
///
/// The desired velocity starts at the agent's current velocity. Each node
/// either replaces it ([`CombineMode::Override`]) or pushes it with a force
/// ([`CombineMode::Accumulate`]). A node may halt the pipeline, in which
/// case the remaining nodes are skipped for this tick.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(transparent))]
pub struct BehaviorPipeline {
    nodes: Vec<SteeringBehavior>,
}

impl BehaviorPipeline {
    pub fn new(nodes: Vec<SteeringBehavior>) -> Self {
        Self { nodes }
    }

    /// Path following followed by collision avoidance
    pub fn path_following(destination: Option<Vec3>) -> Self {
        let mut follower = PathFollowing::new();
        follower.destination = destination;
        Self::new(vec![
            SteeringBehavior::PathFollowing(follower),
            SteeringBehavior::CollisionAvoidance(CollisionAvoidance::default()),
        ])
    }

    /// Checks every node's parameters
    pub fn validate(&self) -> Result<()> {
        self.nodes.iter().try_for_each(SteeringBehavior::validate)
    }

    pub fn nodes(&self) -> &[SteeringBehavior] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [SteeringBehavior] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The first path following node
    pub fn path_follower(&self) -> Option<&PathFollowing> {
        self.nodes.iter().find_map(|n| match n {
            SteeringBehavior::PathFollowing(pf) => Some(pf),
            _ => None,
        })
    }

    pub fn path_follower_mut(&mut self) -> Option<&mut PathFollowing> {
        self.nodes.iter_mut().find_map(|n| match n {
            SteeringBehavior::PathFollowing(pf) => Some(pf),
            _ => None,
        })
    }

    /// The first collision avoidance node
    pub fn collision_avoidance(&self) -> Option<&CollisionAvoidance> {
        self.nodes.iter().find_map(|n| match n {
            SteeringBehavior::CollisionAvoidance(ca) => Some(ca),
            _ => None,
        })
    }

    /// Runs every node and returns the desired velocity
    pub fn update(&mut self, ctx: &SteeringContext, frame: &mut SteeringFrame) -> Vec3 {
        let mut dvel = ctx.agent.vel;
        for node in &mut self.nodes {
            let out = node.evaluate(dvel, ctx, frame);
            dvel = match node.combine_mode() {
                CombineMode::Override => out.velocity,
                CombineMode::Accumulate => apply_force(dvel, out.velocity, ctx.params, ctx.dt),
            };
            if out.halt {
                break;
            }
        }
        dvel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{AgentSnapshot, Environment};
    use crate::steering::{Alignment, Arrive, Cohesion};
    use crate::{AgentParams, CrowdAgentState, MoveRequestState, NavQueryContext, PathCorridor};
    use navcrowd_query::PolyMeshQuery;
    use navcrowd_query::test_mesh_helpers::create_square_mesh;

    fn snap(id: usize, pos: Vec3, vel: Vec3) -> Option<AgentSnapshot> {
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

    fn run(pipeline: &mut BehaviorPipeline, snaps: &[Option<AgentSnapshot>]) -> Result<Vec3> {
        let mesh = create_square_mesh(10.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let params = AgentParams {
            radius: 0.5,
            max_speed: 2.0,
            max_acceleration: 8.0,
            ..Default::default()
        };
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
        let mut corridor = PathCorridor::new();
        let mut frame = SteeringFrame::new(&mut corridor);
        Ok(pipeline.update(&ctx, &mut frame))
    }

    #[test]
    fn test_empty_pipeline_keeps_velocity() -> Result<()> {
        let vel = Vec3::new(1.0, 0.0, 0.5);
        let snaps = vec![snap(0, Vec3::ZERO, vel)];
        let mut pipeline = BehaviorPipeline::default();
        assert_eq!(run(&mut pipeline, &snaps)?, vel);
        Ok(())
    }

    #[test]
    fn test_accumulate_then_override() -> Result<()> {
        let snaps = vec![
            snap(0, Vec3::ZERO, Vec3::ZERO),
            snap(1, Vec3::new(3.0, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0)),
        ];

        // Cohesion alone: force (3, 0, 0) over 0.1 s
        let mut cohesion = BehaviorPipeline::new(vec![SteeringBehavior::Cohesion(Cohesion::new(vec![1]))]);
        let v = run(&mut cohesion, &snaps)?;
        assert!((v - Vec3::new(0.3, 0.0, 0.0)).length() < 1e-5);

        // Forces add up in order
        let mut both = BehaviorPipeline::new(vec![
            SteeringBehavior::Cohesion(Cohesion::new(vec![1])),
            SteeringBehavior::Alignment(Alignment::new(vec![1])),
        ]);
        let v = run(&mut both, &snaps)?;
        assert!((v - Vec3::new(0.3, 0.0, 0.1)).length() < 1e-5);

        // An override discards everything before it
        let mut overridden = BehaviorPipeline::new(vec![
            SteeringBehavior::Cohesion(Cohesion::new(vec![1])),
            SteeringBehavior::Arrive(Arrive::new(Vec3::new(0.0, 0.0, -5.0))),
        ]);
        let v = run(&mut overridden, &snaps)?;
        assert!((v - Vec3::new(0.0, 0.0, -0.8)).length() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_default_pipeline_shape() {
        let pipeline = BehaviorPipeline::path_following(Some(Vec3::ONE));
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.nodes()[0].name(), "PathFollowing");
        assert_eq!(pipeline.nodes()[1].name(), "CollisionAvoidance");
        assert_eq!(
            pipeline.path_follower().and_then(|pf| pf.destination),
            Some(Vec3::ONE)
        );
        assert!(pipeline.collision_avoidance().is_some());
        assert!(pipeline.validate().is_ok());

        let idle = BehaviorPipeline::path_following(None);
        let follower = idle.path_follower().expect("path follower");
        assert_eq!(follower.destination, None);
        assert_eq!(follower.state(), MoveRequestState::None);
    }
}
