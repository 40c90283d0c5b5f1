//! Sampling based velocity obstacle avoidance
//!
//! Candidate velocities are scored against the neighbouring agents
//! (moving circles) and nearby walls (static segments). Each candidate's
//! penalty combines its distance from the desired and current velocity,
//! a side bias and the time to the first predicted impact.

use navcrowd_common::{
    Error, Result, Vec3, dist_2d, dist_point_segment_sqr_2d, dot_2d, normalize_2d, perp_2d,
    rotate_2d, tri_area_2d,
};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

/// Agents closer than this to a wall are considered touching it
const TOUCH_RADIUS: f32 = 0.01;

/// A moving circular obstacle
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObstacleCircle {
    /// Position of the obstacle
    pub p: Vec3,
    /// Velocity of the obstacle
    pub vel: Vec3,
    /// Desired velocity of the obstacle
    pub dvel: Vec3,
    /// Radius of the obstacle
    pub rad: f32,
    /// Use for side selection during sampling
    dp: Vec3,
    /// Use for side selection during sampling
    np: Vec3,
}

/// A static wall segment
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObstacleSegment {
    /// Start point of the obstacle segment
    pub p: Vec3,
    /// End point of the obstacle segment
    pub q: Vec3,
    touch: bool,
}

/// Weights and sampling resolution of the avoidance solver
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(default))]
pub struct ObstacleAvoidanceParams {
    /// How far the sampling disc is shifted towards the desired velocity
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    /// Weight for time of impact
    pub weight_toi: f32,
    /// Prediction horizon in seconds
    pub horiz_time: f32,
    /// Grid size for grid-based sampling
    pub grid_size: u8,
    /// Adaptive divisions for adaptive sampling
    pub adaptive_divs: u8,
    /// Adaptive rings for adaptive sampling
    pub adaptive_rings: u8,
    /// Adaptive refinement passes
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

impl ObstacleAvoidanceParams {
    /// Rejects parameter blocks the solver cannot sample with
    pub fn validate(&self) -> Result<()> {
        if self.horiz_time <= 0.0 || !self.horiz_time.is_finite() {
            return Err(Error::InvalidParam(format!(
                "horiz_time must be positive, got {}",
                self.horiz_time
            )));
        }
        if !(0.0..=1.0).contains(&self.vel_bias) {
            return Err(Error::InvalidParam(format!(
                "vel_bias must be within [0, 1], got {}",
                self.vel_bias
            )));
        }
        if self.grid_size < 2 {
            return Err(Error::InvalidParam("grid_size must be at least 2".into()));
        }
        Ok(())
    }
}

/// One scored candidate velocity
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AvoidanceSample {
    pub vel: Vec3,
    /// Sample cell size, for visualisation
    pub ssize: f32,
    pub pen: f32,
    /// Desired velocity penalty
    pub vpen: f32,
    /// Current velocity penalty
    pub vcpen: f32,
    /// Preferred side penalty
    pub spen: f32,
    /// Collision time penalty
    pub tpen: f32,
}

/// Records every scored candidate of the last solve
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<AvoidanceSample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn add_sample(&mut self, sample: AvoidanceSample) {
        if self.samples.len() < self.max_samples {
            self.samples.push(sample);
        }
    }

    /// Scales every penalty column into `[0, 1]`
    pub fn normalize_samples(&mut self) {
        normalize_column(&mut self.samples, |s| &mut s.pen);
        normalize_column(&mut self.samples, |s| &mut s.vpen);
        normalize_column(&mut self.samples, |s| &mut s.vcpen);
        normalize_column(&mut self.samples, |s| &mut s.spen);
        normalize_column(&mut self.samples, |s| &mut s.tpen);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[AvoidanceSample] {
        &self.samples
    }
}

fn normalize_column(samples: &mut [AvoidanceSample], field: impl Fn(&mut AvoidanceSample) -> &mut f32) {
    let (min, max) = samples.iter_mut().fold((f32::MAX, f32::MIN), |(lo, hi), s| {
        let v = *field(s);
        (lo.min(v), hi.max(v))
    });
    let span = max - min;
    let inv = if span > 0.001 { 1.0 / span } else { 1.0 };
    for s in samples.iter_mut() {
        let v = field(s);
        *v = ((*v - min) * inv).clamp(0.0, 1.0);
    }
}

/// The agent being solved for
#[derive(Debug, Clone, Copy)]
struct Subject {
    pos: Vec3,
    rad: f32,
    vel: Vec3,
    dvel: Vec3,
}

/// Velocity obstacle solver for a single agent
#[derive(Debug, Clone)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,

    max_circles: usize,
    circles: Vec<ObstacleCircle>,

    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl Default for ObstacleAvoidanceQuery {
    fn default() -> Self {
        Self::new(6, 8)
    }
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment { p, q, touch: false });
    }

    pub fn circles(&self) -> &[ObstacleCircle] {
        &self.circles
    }

    pub fn segments(&self) -> &[ObstacleSegment] {
        &self.segments
    }

    /// Samples a regular grid of velocities around the biased desired
    /// velocity. Returns the best velocity and the number of samples.
    ///
    /// Fails with `SolverDegenerate` when no candidate could be scored;
    /// callers should stop the agent in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> Result<(Vec3, usize)> {
        let subject = self.begin(pos, rad, vmax, vel, dvel, params, debug.as_deref_mut())?;

        let grid = usize::from(self.params.grid_size);
        let cvx = dvel.x * self.params.vel_bias;
        let cvz = dvel.z * self.params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - self.params.vel_bias) / (grid - 1) as f32;
        let half = (grid - 1) as f32 * cs * 0.5;

        let mut best = Best::new(dvel);
        let mut ns = 0;
        for y in 0..grid {
            for x in 0..grid {
                let vcand = Vec3::new(cvx + x as f32 * cs - half, 0.0, cvz + y as f32 * cs - half);
                if vcand.x * vcand.x + vcand.z * vcand.z > sqr(vmax + cs / 2.0) {
                    continue;
                }
                let penalty = self.process_sample(vcand, cs, &subject, best.penalty, debug.as_deref_mut());
                ns += 1;
                best.offer(vcand, penalty);
            }
        }

        best.velocity().map(|v| (v, ns))
    }

    /// Samples concentric rings aligned with the desired velocity,
    /// refining around the best candidate `adaptive_depth` times.
    /// Returns the best velocity and the number of samples.
    ///
    /// Fails with `SolverDegenerate` when no candidate could be scored;
    /// callers should stop the agent in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> Result<(Vec3, usize)> {
        let subject = self.begin(pos, rad, vmax, vel, dvel, params, debug.as_deref_mut())?;

        let pattern = sampling_pattern(
            dvel,
            usize::from(self.params.adaptive_divs),
            usize::from(self.params.adaptive_rings),
        );

        // Start sampling
        let mut cr = vmax * (1.0 - self.params.vel_bias);
        let mut res = Vec3::new(dvel.x * self.params.vel_bias, 0.0, dvel.z * self.params.vel_bias);
        let mut ns = 0;

        for _ in 0..self.params.adaptive_depth.max(1) {
            let mut best = Best::new(dvel);
            for &(px, pz) in &pattern {
                let vcand = Vec3::new(res.x + px * cr, 0.0, res.z + pz * cr);
                if vcand.x * vcand.x + vcand.z * vcand.z > sqr(vmax + 0.001) {
                    continue;
                }
                let penalty = self.process_sample(vcand, cr / 10.0, &subject, best.penalty, debug.as_deref_mut());
                ns += 1;
                best.offer(vcand, penalty);
            }
            res = best.velocity()?;
            cr *= 0.5;
        }

        Ok((res, ns))
    }

    #[allow(clippy::too_many_arguments)]
    fn begin(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> Result<Subject> {
        params.validate()?;
        if !vmax.is_finite() || vmax < 0.0 {
            return Err(Error::InvalidParam(format!("invalid max speed {}", vmax)));
        }
        self.params = *params;
        self.inv_horiz_time = 1.0 / self.params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
        if let Some(debug) = debug {
            debug.reset();
        }
        self.prepare(pos, dvel);
        Ok(Subject { pos, rad, vel, dvel })
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        // Prepare obstacles
        for cir in &mut self.circles {
            // Side
            cir.dp = normalize_2d(&(pos - cir.p));
            let dv = cir.dvel - dvel;

            let a = tri_area_2d(&Vec3::ZERO, &cir.dp, &dv);
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        for seg in &mut self.segments {
            // Precalc if the agent is really close to the segment
            let (d, _) = dist_point_segment_sqr_2d(&pos, &seg.p, &seg.q);
            seg.touch = d < sqr(TOUCH_RADIUS);
        }
    }

    /// Scores `vcand`. Returns `None` when the sample is certain to be
    /// worse than `min_penalty` and was abandoned early.
    fn process_sample(
        &self,
        vcand: Vec3,
        cs: f32,
        subject: &Subject,
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> Option<f32> {
        let params = &self.params;

        // Penalty for straying away from the desired and current velocities
        let vpen = params.weight_des_vel * (dist_2d(&vcand, &subject.dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(&vcand, &subject.vel) * self.inv_vmax);

        // Hit time threshold beyond which this sample cannot win
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return None;
        }

        // Find min time of impact and exit amongst all obstacles
        let mut tmin = params.horiz_time;
        let mut side = 0.0;

        for cir in &self.circles {
            // RVO
            let vab = vcand * 2.0 - subject.vel - cir.vel;

            side += (dot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(dot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);

            let Some((mut htmin, htmax)) =
                sweep_circle_circle(subject.pos, subject.rad, vab, cir.p, cir.rad)
            else {
                continue;
            };

            // Avoid more when overlapped
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return None;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                // If the velocity is pointing away from the wall, no collision
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                if dot_2d(&snorm, &vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(subject.pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Avoid less when facing walls
            let htmin = htmin * 2.0;
            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return None;
                }
            }
        }

        // Normalize side bias, to prevent it dominating too much
        if !self.circles.is_empty() {
            side /= self.circles.len() as f32;
        }

        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));
        let penalty = vpen + vcpen + spen + tpen;

        if !penalty.is_finite() {
            return None;
        }

        if let Some(debug) = debug {
            debug.add_sample(AvoidanceSample {
                vel: vcand,
                ssize: cs,
                pen: penalty,
                vpen,
                vcpen,
                spen,
                tpen,
            });
        }

        Some(penalty)
    }
}

/// Running minimum over scored samples, ties going to the candidate
/// closest to the desired velocity
struct Best {
    dvel: Vec3,
    penalty: f32,
    vel: Option<Vec3>,
}

impl Best {
    fn new(dvel: Vec3) -> Self {
        Self {
            dvel,
            penalty: f32::MAX,
            vel: None,
        }
    }

    fn offer(&mut self, vcand: Vec3, penalty: Option<f32>) {
        let Some(penalty) = penalty else {
            return;
        };
        let better = match self.vel {
            None => true,
            Some(cur) => {
                penalty < self.penalty
                    || (penalty == self.penalty
                        && dist_2d(&vcand, &self.dvel) < dist_2d(&cur, &self.dvel))
            }
        };
        if better {
            self.penalty = penalty;
            self.vel = Some(vcand);
        }
    }

    fn velocity(&self) -> Result<Vec3> {
        self.vel.ok_or(Error::SolverDegenerate)
    }
}

/// Unit sampling pattern: the origin plus `rings` rings of `divs` points,
/// the first point of each ring aligned with the desired direction and
/// every other ring rotated by half a division.
fn sampling_pattern(dvel: Vec3, divs: usize, rings: usize) -> Vec<(f32, f32)> {
    let nd = divs.clamp(1, MAX_PATTERN_DIVS);
    let nr = rings.clamp(1, MAX_PATTERN_RINGS);
    let da = std::f32::consts::TAU / nd as f32;
    let (sa, ca) = da.sin_cos();

    // Desired direction and the direction rotated by half a division
    let ddir0 = normalize_2d(&dvel);
    let ddir1 = rotate_2d(&ddir0, da * 0.5);
    let ddir = [ddir0, ddir1];

    // Always add sample at zero
    let mut pat = Vec::with_capacity(nd * nr + 1);
    pat.push((0.0, 0.0));

    for j in 0..nr {
        let r = (nr - j) as f32 / nr as f32;
        let d = ddir[j % 2];
        let first = (d.x * r, d.z * r);
        pat.push(first);

        let mut last1 = first;
        let mut last2 = first;
        let mut i = 1;
        while i + 1 < nd {
            // Next point on the "right" (rotate CW)
            let right = (last1.0 * ca + last1.1 * sa, -last1.0 * sa + last1.1 * ca);
            // Next point on the "left" (rotate CCW)
            let left = (last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca);
            pat.push(right);
            pat.push(left);
            last1 = right;
            last2 = left;
            i += 2;
        }

        if nd % 2 == 0 {
            pat.push((last2.0 * ca - last2.1 * sa, last2.0 * sa + last2.1 * ca));
        }
    }

    pat
}

/// Time window during which two moving circles overlap
fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(&s, &s) - r * r;
    let a = dot_2d(&v, &v);
    if a < EPS {
        // not moving
        return None;
    }

    // Overlap, calc time to exit
    let b = dot_2d(&v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        // no intersection
        return None;
    }
    let a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * a, (b + rd) * a))
}

/// Intersection of the ray `ap + u * t`, `t` in `[0, 1]`, with the
/// segment `bp..bq`
fn isect_ray_seg(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(&v, &w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(&u, &w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

fn sqr(x: f32) -> f32 {
    x * x
}
