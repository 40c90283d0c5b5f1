//! Bounded queue of full path requests
//!
//! Agents whose quick local search could not reach their target enqueue
//! a full search here. The crowd services a few requests per tick and
//! agents poll their handle until the result is ready.

use log::debug;
use navcrowd_common::{Error, Result, Vec3};
use navcrowd_query::{PolyRef, QueryFilter};

use crate::NavQueryContext;

const MAX_QUEUE: usize = 8;

/// Completed results not read within this many updates are dropped
const MAX_KEEP_ALIVE: u32 = 2;

/// Handle of a queued path request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathQueueRef(u32);

/// State of a queued path request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathQueueStatus {
    /// Queued, not searched yet
    Working,
    Success,
    Failure,
    /// Unknown or expired handle
    Invalid,
}

/// A finished path search
#[derive(Debug, Clone, PartialEq)]
pub struct PathQueueResult {
    pub path: Vec<PolyRef>,
    /// The path ends at the polygon closest to the target, not on it
    pub partial: bool,
}

#[derive(Debug, Clone)]
struct PathQuery {
    handle: PathQueueRef,
    start_pos: Vec3,
    end_pos: Vec3,
    start_ref: PolyRef,
    end_ref: PolyRef,
    filter: QueryFilter,
    status: PathQueueStatus,
    result: Vec<PolyRef>,
    keep_alive: u32,
}

/// Fixed size FIFO of path requests
#[derive(Debug, Clone)]
pub struct PathQueue {
    queue: Vec<Option<PathQuery>>,
    next_handle: u32,
    max_path_size: usize,
    queue_head: usize,
}

impl PathQueue {
    pub fn new(max_path_size: usize) -> Self {
        Self {
            queue: vec![None; MAX_QUEUE],
            next_handle: 1,
            max_path_size: max_path_size.max(1),
            queue_head: 0,
        }
    }

    /// Runs up to `max_requests` pending searches, oldest slot first
    pub fn update(&mut self, max_requests: usize, nav: &NavQueryContext) {
        let mut remaining = max_requests;
        for _ in 0..MAX_QUEUE {
            let slot_idx = self.queue_head % MAX_QUEUE;
            let Some(query) = self.queue[slot_idx].as_mut() else {
                self.queue_head += 1;
                continue;
            };

            // Handle completed request
            if query.status != PathQueueStatus::Working {
                // If the path result has not been read in few frames, free the slot
                query.keep_alive += 1;
                if query.keep_alive > MAX_KEEP_ALIVE {
                    debug!("Path request {:?} expired", query.handle);
                    self.queue[slot_idx] = None;
                }
                self.queue_head += 1;
                continue;
            }

            if remaining == 0 {
                break;
            }
            remaining -= 1;

            match nav.query().find_path(
                query.start_ref,
                query.end_ref,
                query.start_pos,
                query.end_pos,
                &query.filter,
                self.max_path_size,
            ) {
                Ok(path) if !path.is_empty() => {
                    query.result = path;
                    query.status = PathQueueStatus::Success;
                }
                Ok(_) => query.status = PathQueueStatus::Failure,
                Err(err) => {
                    debug!("Path request {:?} failed: {}", query.handle, err);
                    query.status = PathQueueStatus::Failure;
                }
            }
            self.queue_head += 1;
        }
    }

    /// Enqueues a search. Returns `None` when every slot is taken.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Option<PathQueueRef> {
        // Find empty slot
        let slot = self.queue.iter_mut().find(|q| q.is_none())?;

        let handle = PathQueueRef(self.next_handle);
        self.next_handle = self.next_handle.checked_add(1).unwrap_or(1);

        *slot = Some(PathQuery {
            handle,
            start_pos,
            end_pos,
            start_ref,
            end_ref,
            filter: filter.clone(),
            status: PathQueueStatus::Working,
            result: Vec::new(),
            keep_alive: 0,
        });
        Some(handle)
    }

    pub fn request_status(&self, handle: PathQueueRef) -> PathQueueStatus {
        self.find(handle)
            .map_or(PathQueueStatus::Invalid, |q| q.status)
    }

    /// Takes a finished result and frees its slot.
    ///
    /// Returns `NoPathFound` for failed searches and `InvalidParam` for
    /// unknown handles or searches still in progress.
    pub fn take_path_result(&mut self, handle: PathQueueRef) -> Result<PathQueueResult> {
        let slot = self
            .queue
            .iter_mut()
            .find(|q| q.as_ref().is_some_and(|q| q.handle == handle))
            .ok_or_else(|| Error::InvalidParam(format!("unknown path request {:?}", handle)))?;

        let Some(query) = slot.as_ref() else {
            return Err(Error::InvalidParam(format!("unknown path request {:?}", handle)));
        };
        let status = query.status;
        match status {
            PathQueueStatus::Working => Err(Error::InvalidParam(format!(
                "path request {:?} is still in progress",
                handle
            ))),
            PathQueueStatus::Success => {
                let partial = query.result.last() != Some(&query.end_ref);
                let path = query.result.clone();
                *slot = None;
                Ok(PathQueueResult { path, partial })
            }
            _ => {
                *slot = None;
                Err(Error::NoPathFound(format!("path request {:?} failed", handle)))
            }
        }
    }

    /// Drops a request, if it is still queued
    pub fn cancel(&mut self, handle: PathQueueRef) {
        for slot in &mut self.queue {
            if slot.as_ref().is_some_and(|q| q.handle == handle) {
                *slot = None;
            }
        }
    }

    /// Number of occupied slots
    pub fn pending(&self) -> usize {
        self.queue.iter().filter(|q| q.is_some()).count()
    }

    fn find(&self, handle: PathQueueRef) -> Option<&PathQuery> {
        self.queue
            .iter()
            .flatten()
            .find(|q| q.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::test_mesh_helpers::{create_islands_with_offmesh, create_square_mesh};
    use navcrowd_query::{PolyFlags, PolyMeshQuery};

    #[test]
    fn test_request_then_result() -> Result<()> {
        let mesh = create_square_mesh(5.0, 3)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (s, sp) = nav.find_nearest(Vec3::new(-4.0, 0.0, -4.0)).expect("start");
        let (e, ep) = nav.find_nearest(Vec3::new(4.0, 0.0, 4.0)).expect("end");

        let mut queue = PathQueue::new(64);
        let handle = queue.request(s, e, sp, ep, nav.filter()).expect("slot");
        assert_eq!(queue.request_status(handle), PathQueueStatus::Working);
        assert!(queue.take_path_result(handle).is_err());

        queue.update(1, &nav);
        assert_eq!(queue.request_status(handle), PathQueueStatus::Success);

        let res = queue.take_path_result(handle)?;
        assert_eq!(res.path.first(), Some(&s));
        assert_eq!(res.path.last(), Some(&e));
        assert!(!res.partial);
        assert_eq!(queue.request_status(handle), PathQueueStatus::Invalid);
        assert_eq!(queue.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_queue_capacity_and_budget() -> Result<()> {
        let mesh = create_square_mesh(5.0, 2)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (s, sp) = nav.find_nearest(Vec3::new(-2.0, 0.0, -2.0)).expect("start");
        let (e, ep) = nav.find_nearest(Vec3::new(2.0, 0.0, 2.0)).expect("end");

        let mut queue = PathQueue::new(16);
        let handles: Vec<PathQueueRef> = (0..MAX_QUEUE)
            .map(|_| queue.request(s, e, sp, ep, nav.filter()).expect("slot"))
            .collect();
        assert!(queue.request(s, e, sp, ep, nav.filter()).is_none());

        // Only two searches per update
        queue.update(2, &nav);
        let done = handles
            .iter()
            .filter(|&&h| queue.request_status(h) == PathQueueStatus::Success)
            .count();
        assert_eq!(done, 2);
        Ok(())
    }

    #[test]
    fn test_unread_results_expire() -> Result<()> {
        let mesh = create_square_mesh(5.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (s, sp) = nav.find_nearest(Vec3::ZERO).expect("start");

        let mut queue = PathQueue::new(16);
        let handle = queue.request(s, s, sp, sp, nav.filter()).expect("slot");
        queue.update(1, &nav);
        for _ in 0..=MAX_KEEP_ALIVE {
            queue.update(1, &nav);
        }
        assert_eq!(queue.request_status(handle), PathQueueStatus::Invalid);
        assert!(matches!(queue.take_path_result(handle), Err(Error::InvalidParam(_))));
        Ok(())
    }

    #[test]
    fn test_partial_and_failed_results() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let mut nav = NavQueryContext::new(&query, Vec3::ONE);
        let (s, sp) = nav.find_nearest(Vec3::new(-5.0, 0.0, 0.0)).expect("start");
        let (e, ep) = nav.find_nearest(Vec3::new(6.0, 0.0, 0.0)).expect("end");

        // The jump is the only way across
        nav.filter_mut().exclude_flags = PolyFlags::JUMP;
        let mut queue = PathQueue::new(16);
        let partial = queue.request(s, e, sp, ep, nav.filter()).expect("slot");
        queue.update(1, &nav);
        let res = queue.take_path_result(partial)?;
        assert!(res.partial);

        // An excluded start polygon fails outright
        nav.filter_mut().exclude_flags = PolyFlags::WALK;
        let failed = queue.request(s, e, sp, ep, nav.filter()).expect("slot");
        queue.update(1, &nav);
        assert_eq!(queue.request_status(failed), PathQueueStatus::Failure);
        assert!(matches!(queue.take_path_result(failed), Err(Error::NoPathFound(_))));
        Ok(())
    }

    #[test]
    fn test_cancel_frees_slot() -> Result<()> {
        let mesh = create_square_mesh(5.0, 1)?;
        let query = PolyMeshQuery::new(&mesh);
        let nav = NavQueryContext::new(&query, Vec3::ONE);
        let (s, sp) = nav.find_nearest(Vec3::ZERO).expect("start");

        let mut queue = PathQueue::new(16);
        let handle = queue.request(s, s, sp, sp, nav.filter()).expect("slot");
        assert_eq!(queue.pending(), 1);
        queue.cancel(handle);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.request_status(handle), PathQueueStatus::Invalid);
        Ok(())
    }
}
