use gilib::renderer::voxel::{cascade_offset, parent_cell, snap_center, VoxelLayout, VoxelLevel};
use glam::{IVec3, UVec3, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const EPSILON: f32 = 1e-5;

fn random_position(rng: &mut SmallRng, range: f32) -> Vec3 {
    Vec3::new(
        rng.gen_range(-range..range),
        rng.gen_range(-range..range),
        rng.gen_range(-range..range),
    )
}

fn cell_center(level: &VoxelLevel, cell: UVec3) -> Vec3 {
    level.min_corner() + (cell.as_vec3() + Vec3::splat(0.5)) * level.voxel_size
}

#[test]
fn same_camera_position_gives_same_grids() {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut a = VoxelLayout::new(0.25, 16, 3).unwrap();
    let mut b = VoxelLayout::new(0.25, 16, 3).unwrap();

    for _ in 0..32 {
        let camera = random_position(&mut rng, 50.0);
        // Visit a different position first; snapping keeps no history.
        a.update(random_position(&mut rng, 50.0));
        a.update(camera);
        b.update(camera);
        for (la, lb) in a.levels().iter().zip(b.levels()) {
            assert_eq!(la.center, lb.center);
        }
    }
}

#[test]
fn finest_grid_center_is_snapped_camera() {
    let mut rng = SmallRng::seed_from_u64(11);
    let mut layout = VoxelLayout::new(0.5, 32, 2).unwrap();
    for _ in 0..32 {
        let camera = random_position(&mut rng, 100.0);
        layout.update(camera);
        let finest = layout.level(0).unwrap();
        assert!((finest.center - snap_center(camera, 0.5)).abs().max_element() < EPSILON);
        assert!((finest.center - camera).abs().max_element() <= 0.5 + EPSILON);
    }
}

#[test]
fn every_level_contains_the_camera() {
    let mut rng = SmallRng::seed_from_u64(3);
    let mut layout = VoxelLayout::new(0.5, 16, 3).unwrap();
    for _ in 0..16 {
        let camera = random_position(&mut rng, 40.0);
        layout.update(camera);
        for level in layout.levels().iter().filter(|l| l.level <= 0) {
            assert!(level.cell_of(camera).is_some(), "level {} misses camera", level.level);
        }
    }
}

#[test]
fn aligned_centers_have_no_cascade_offset() {
    let voxel = 0.5;
    for i in -4..4 {
        let center = Vec3::new(i as f32, (2 * i) as f32, -(i as f32)) * 2.0 * voxel;
        assert_eq!(cascade_offset(center, voxel), IVec3::ZERO);
    }
}

#[test]
fn cascade_offsets_are_unit_bounded() {
    let mut rng = SmallRng::seed_from_u64(19);
    for _ in 0..64 {
        let center = snap_center(random_position(&mut rng, 30.0), 0.25);
        let offset = cascade_offset(center, 0.25);
        assert!(offset.cmpge(IVec3::ZERO).all() && offset.cmple(IVec3::ONE).all());
    }
}

#[test]
fn filter_children_fall_inside_their_parent_cell() {
    let mut rng = SmallRng::seed_from_u64(23);
    let mut layout = VoxelLayout::new(0.5, 16, 3).unwrap();

    for _ in 0..8 {
        layout.update(random_position(&mut rng, 60.0));
        for step in layout.filter_steps() {
            let src = *layout.level(step.src).unwrap();
            let dst = *layout.level(step.dst).unwrap();
            let fine_res = src.resolution as i32;
            let coarse_res = dst.resolution as i32;

            for _ in 0..64 {
                let fine = UVec3::new(
                    rng.gen_range(0..src.resolution),
                    rng.gen_range(0..src.resolution),
                    rng.gen_range(0..src.resolution),
                );
                let expected = parent_cell(fine.as_ivec3(), step.offset, fine_res, coarse_res);
                match dst.cell_of(cell_center(&src, fine)) {
                    Some(cell) => assert_eq!(
                        cell.as_ivec3(),
                        expected,
                        "step {} -> {}",
                        step.src,
                        step.dst
                    ),
                    None => assert!(
                        expected.cmplt(IVec3::ZERO).any()
                            || expected.cmpge(IVec3::splat(coarse_res)).any()
                    ),
                }
            }
        }
    }
}

#[test]
fn stack_steps_run_before_pyramid_steps() {
    let layout = VoxelLayout::new(1.0, 32, 3).unwrap();
    let steps = layout.filter_steps();
    let first_pyramid = steps.iter().position(|s| !s.is_stack()).unwrap();
    assert!(steps[..first_pyramid].iter().all(|s| s.is_stack()));
    assert!(steps[first_pyramid..].iter().all(|s| !s.is_stack()));
    assert_eq!((steps[0].src, steps[0].dst), (0, -1));
    assert!(steps[..first_pyramid].windows(2).all(|w| w[0].dst > w[1].dst));
    assert!(steps[first_pyramid..].windows(2).all(|w| w[0].dst < w[1].dst));
}

#[test]
fn every_filter_source_is_final_before_it_is_read() {
    let layout = VoxelLayout::new(0.5, 32, 4).unwrap();
    let steps = layout.filter_steps();
    for (i, step) in steps.iter().enumerate() {
        // Level 0 is written by injection only; every other source must
        // already have been filtered, and nothing writes it afterwards.
        if step.src != 0 {
            assert!(steps[..i].iter().any(|s| s.dst == step.src), "{step:?}");
        }
        assert!(steps[i..].iter().all(|s| s.dst != step.src), "{step:?}");
    }
}

#[test]
fn resolution_is_rounded_or_rejected() {
    assert_eq!(VoxelLayout::new(0.5, 48, 2).unwrap().resolution(), 64);
    assert_eq!(VoxelLayout::new(0.5, 64, 2).unwrap().resolution(), 64);
    assert!(VoxelLayout::new(0.5, 0, 2).is_err());
    assert!(VoxelLayout::new(0.5, 300, 2).is_err());
}

#[test]
fn coarser_cascades_double_in_size() {
    let layout = VoxelLayout::new(0.25, 8, 4).unwrap();
    for k in 1..=4 {
        let coarse = layout.level(-k).unwrap();
        let fine = layout.level(-k + 1).unwrap();
        assert!((coarse.voxel_size - 2.0 * fine.voxel_size).abs() < EPSILON);
        assert_eq!(coarse.resolution, fine.resolution);
    }
    let domain = layout.domain();
    let coarsest = layout.level(-4).unwrap();
    assert!((domain.max.x - domain.min.x - coarsest.extent()).abs() < EPSILON);
}
