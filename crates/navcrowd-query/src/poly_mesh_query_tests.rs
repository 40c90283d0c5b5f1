//! Tests for the polygon mesh query implementation

#[cfg(test)]
mod tests {
    use crate::test_mesh_helpers::{
        create_corner_mesh, create_islands_with_offmesh, create_square_mesh,
    };
    use crate::{
        NavMeshQuery, PolyFlags, PolyMeshQuery, PolyRef, QueryFilter, StraightPathFlags,
    };
    use navcrowd_common::{Result, Vec3};

    const EXT: Vec3 = Vec3::new(1.0, 1.0, 1.0);

    fn close(a: Vec3, b: Vec3) -> bool {
        a.distance(b) < 1e-4
    }

    #[test]
    fn test_find_nearest_poly_snaps_to_surface() -> Result<()> {
        let mesh = create_square_mesh(5.0, 2)?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let (r, p) = query.find_nearest_poly(Vec3::new(2.0, 0.5, 2.0), EXT, &filter)?;
        assert!(r.is_valid());
        assert!(close(p, Vec3::new(2.0, 0.0, 2.0)));

        // Outside the extents
        assert!(
            query
                .find_nearest_poly(Vec3::new(20.0, 0.0, 0.0), EXT, &filter)
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_find_path_across_grid() -> Result<()> {
        let mesh = create_square_mesh(5.0, 4)?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let start = Vec3::new(-4.0, 0.0, -4.0);
        let end = Vec3::new(4.0, 0.0, 4.0);
        let (s, _) = query.find_nearest_poly(start, EXT, &filter)?;
        let (e, _) = query.find_nearest_poly(end, EXT, &filter)?;

        let path = query.find_path(s, e, start, end, &filter, 256)?;
        assert_eq!(path.first(), Some(&s));
        assert_eq!(path.last(), Some(&e));
        // Diagonal across a 4x4 grid needs at least 7 cells
        assert!(path.len() >= 7);

        let truncated = query.find_path(s, e, start, end, &filter, 3)?;
        assert_eq!(truncated.len(), 3);
        assert_eq!(&truncated[..], &path[..3]);
        Ok(())
    }

    #[test]
    fn test_find_path_partial_when_blocked() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let mut filter = QueryFilter::default();
        filter.exclude_flags = PolyFlags::JUMP;

        let path = query.find_path(
            PolyRef::new(1),
            PolyRef::new(4),
            Vec3::new(-5.0, 0.0, 0.0),
            Vec3::new(6.0, 0.0, 0.0),
            &filter,
            64,
        )?;
        assert_eq!(path, vec![PolyRef::new(1), PolyRef::new(2)]);
        Ok(())
    }

    #[test]
    fn test_straight_path_turns_at_corner() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let path = [PolyRef::new(1), PolyRef::new(2), PolyRef::new(3)];

        let corners = query.find_straight_path(
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(3.0, 0.0, 3.5),
            &path,
            8,
        )?;
        assert_eq!(corners.len(), 3);
        assert_eq!(corners[0].flags, StraightPathFlags::START);
        assert!(close(corners[1].pos, Vec3::new(2.0, 0.0, 2.0)));
        assert_eq!(corners[1].flags, StraightPathFlags::empty());
        assert_eq!(corners[1].poly, PolyRef::new(3));
        assert_eq!(corners[2].flags, StraightPathFlags::END);
        assert!(close(corners[2].pos, Vec3::new(3.0, 0.0, 3.5)));

        let limited = query.find_straight_path(
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(3.0, 0.0, 3.5),
            &path,
            2,
        )?;
        assert_eq!(limited.len(), 2);
        Ok(())
    }

    #[test]
    fn test_path_through_offmesh_connection() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = Vec3::new(-5.0, 0.0, 0.0);
        let end = Vec3::new(6.0, 0.0, 0.0);

        let path = query.find_path(PolyRef::new(1), PolyRef::new(4), start, end, &filter, 64)?;
        assert_eq!(
            path,
            vec![
                PolyRef::new(1),
                PolyRef::new(2),
                PolyRef::new(5),
                PolyRef::new(3),
                PolyRef::new(4)
            ]
        );

        let corners = query.find_straight_path(start, end, &path, 16)?;
        let offmesh = corners
            .iter()
            .find(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
            .expect("off-mesh corner");
        assert!(close(offmesh.pos, Vec3::new(-1.5, 0.0, 0.0)));
        assert_eq!(offmesh.poly, PolyRef::new(5));
        assert!(corners.last().is_some_and(|c| c.flags.contains(StraightPathFlags::END)));
        Ok(())
    }

    #[test]
    fn test_offmesh_end_points_follow_direction() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);

        let (s, e) = query.get_off_mesh_connection_end_points(PolyRef::new(2), PolyRef::new(5))?;
        assert!(close(s, Vec3::new(-1.5, 0.0, 0.0)));
        assert!(close(e, Vec3::new(2.5, 0.0, 0.0)));

        let (s, e) = query.get_off_mesh_connection_end_points(PolyRef::new(3), PolyRef::new(5))?;
        assert!(close(s, Vec3::new(2.5, 0.0, 0.0)));
        assert!(close(e, Vec3::new(-1.5, 0.0, 0.0)));

        assert!(
            query
                .get_off_mesh_connection_end_points(PolyRef::new(2), PolyRef::new(1))
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_raycast_reaches_end() -> Result<()> {
        let mesh = create_square_mesh(5.0, 2)?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = Vec3::new(-4.0, 0.0, -3.0);
        let (s, _) = query.find_nearest_poly(start, EXT, &filter)?;

        let hit = query.raycast(s, start, Vec3::new(4.0, 0.0, 3.5), &filter)?;
        assert!(!hit.hit_wall());
        assert_eq!(hit.path.len(), 3);
        Ok(())
    }

    #[test]
    fn test_raycast_hits_wall() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let hit = query.raycast(
            PolyRef::new(1),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(0.5, 0.0, 3.5),
            &filter,
        )?;
        assert!(hit.hit_wall());
        assert!((hit.t - 0.5).abs() < 1e-5);
        assert!(close(hit.hit_normal, Vec3::new(0.0, 0.0, -1.0)));
        assert_eq!(hit.path, vec![PolyRef::new(1)]);
        Ok(())
    }

    #[test]
    fn test_move_along_surface_slides_to_wall() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let (pos, visited) = query.move_along_surface(
            PolyRef::new(1),
            Vec3::new(1.0, 0.0, 1.0),
            Vec3::new(1.0, 0.0, 3.0),
            &filter,
            16,
        )?;
        assert!(close(pos, Vec3::new(1.0, 0.0, 2.0)));
        assert_eq!(visited, vec![PolyRef::new(1)]);

        let (pos, visited) = query.move_along_surface(
            PolyRef::new(1),
            Vec3::new(1.5, 0.0, 1.0),
            Vec3::new(2.5, 0.0, 1.0),
            &filter,
            16,
        )?;
        assert!(close(pos, Vec3::new(2.5, 0.0, 1.0)));
        assert_eq!(visited, vec![PolyRef::new(1), PolyRef::new(2)]);
        Ok(())
    }

    #[test]
    fn test_move_along_surface_search_limit() -> Result<()> {
        let mesh = create_square_mesh(5.0, 4)?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = Vec3::new(-4.0, 0.0, -4.0);
        let (start_ref, _) = query.find_nearest_poly(start, EXT, &filter)?;

        let (pos, visited) =
            query.move_along_surface(start_ref, start, Vec3::new(4.0, 0.0, -4.0), &filter, 2)?;
        assert!(!visited.is_empty() && visited.len() <= 2);
        assert_eq!(visited[0], start_ref);
        // The result lies in the last polygon returned
        let last = *visited.last().expect("visited");
        assert!(close(query.closest_point_on_poly(last, pos)?, pos));
        assert!(pos.x < 4.0);
        Ok(())
    }

    #[test]
    fn test_move_along_surface_ignores_offmesh_links() -> Result<()> {
        let mesh = create_islands_with_offmesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let (pos, visited) = query.move_along_surface(
            PolyRef::new(2),
            Vec3::new(-2.0, 0.0, 0.0),
            Vec3::new(2.5, 0.0, 0.0),
            &filter,
            16,
        )?;
        assert!(close(pos, Vec3::new(-1.0, 0.0, 0.0)));
        assert_eq!(visited, vec![PolyRef::new(2)]);
        Ok(())
    }

    #[test]
    fn test_wall_segments_and_neighbourhood() -> Result<()> {
        let mesh = create_corner_mesh()?;
        let query = PolyMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let walls = query.get_poly_wall_segments(PolyRef::new(2), &filter)?;
        assert_eq!(walls.len(), 2);

        let mut closed = filter.clone();
        closed.exclude_flags = PolyFlags::WALK;
        assert!(!query.is_valid_poly_ref(PolyRef::new(2), &closed));

        let local = query.find_local_neighbourhood(
            PolyRef::new(1),
            Vec3::new(1.5, 0.0, 1.0),
            1.0,
            &filter,
            16,
        )?;
        assert_eq!(local, vec![PolyRef::new(1), PolyRef::new(2)]);
        Ok(())
    }

    #[test]
    fn test_poly_height_on_slope() -> Result<()> {
        let mut builder = crate::PolyMeshBuilder::new();
        let a = builder.add_vertex(Vec3::new(0.0, 0.0, 0.0));
        let b = builder.add_vertex(Vec3::new(0.0, 0.0, 2.0));
        let c = builder.add_vertex(Vec3::new(2.0, 1.0, 2.0));
        let d = builder.add_vertex(Vec3::new(2.0, 1.0, 0.0));
        builder.add_polygon(&[a, b, c, d], PolyFlags::WALK, 0)?;
        let mesh = builder.build()?;
        let query = PolyMeshQuery::new(&mesh);

        let h = query.get_poly_height(PolyRef::new(1), Vec3::new(1.0, 5.0, 1.0))?;
        assert!((h - 0.5).abs() < 1e-5);
        assert!(
            query
                .get_poly_height(PolyRef::new(1), Vec3::new(3.0, 0.0, 1.0))
                .is_err()
        );
        Ok(())
    }
}
