use gilib::renderer::lights::{LightPacker, MAX_POINT_LIGHTS};
use gilib::renderer::shadow::{paraboloid_uv, point_light_view, AtlasAllocator, AtlasRegion};
use gilib::scene::{DirectionalLight, PointLight, Scene};
use gilib::settings::LightOverflowPolicy;
use glam::{Vec2, Vec3};

const EPSILON: f32 = 1e-5;

/// Allocate `kinds` in order (`true` for directional) and return the regions
/// that fit.
fn allocate_sequence(allocator: &mut AtlasAllocator, kinds: &[bool]) -> Vec<Option<AtlasRegion>> {
    kinds
        .iter()
        .map(|&directional| {
            if directional {
                allocator.allocate_directional()
            } else {
                allocator.allocate_point()
            }
        })
        .collect()
}

#[test]
fn mixed_allocations_never_overlap() {
    let mut allocator = AtlasAllocator::new(6);
    let kinds = [false, true, false, false, true, false, false, false, false];
    let regions: Vec<AtlasRegion> = allocate_sequence(&mut allocator, &kinds)
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(regions.len(), kinds.len());

    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn allocation_order_is_monotonic() {
    let mut allocator = AtlasAllocator::new(8);
    let kinds = [false, false, true, false, true, true, false];
    let mut last_used = 0;
    let mut last_page = 0;
    for region in allocate_sequence(&mut allocator, &kinds).into_iter().flatten() {
        assert!(allocator.slots_used() > last_used);
        assert!(region.page >= last_page);
        last_used = allocator.slots_used();
        last_page = region.page;
    }
}

#[test]
fn reset_starts_a_new_frame() {
    let mut allocator = AtlasAllocator::new(2);
    let first = allocate_sequence(&mut allocator, &[false, true]);
    assert!(allocate_sequence(&mut allocator, &[false]).iter().all(Option::is_none));

    allocator.reset();
    assert_eq!(allocator.slots_used(), 0);
    let second = allocate_sequence(&mut allocator, &[false, true]);
    assert_eq!(first, second);
}

#[test]
fn overflow_leaves_later_lights_without_a_region() {
    let mut allocator = AtlasAllocator::new(1);
    let regions = allocate_sequence(&mut allocator, &[false, false, false, false, false, true]);
    assert_eq!(regions.iter().filter(|r| r.is_some()).count(), 4);
    assert!(regions[4].is_none() && regions[5].is_none());
    assert_eq!(allocator.pages_used(), 1);
}

#[test]
fn both_hemispheres_cover_every_direction() {
    let light = Vec3::new(2.0, 3.0, -1.0);
    let view = point_light_view(light);
    let directions = [
        Vec3::X,
        -Vec3::X,
        Vec3::Y,
        -Vec3::Y,
        Vec3::Z,
        -Vec3::Z,
        Vec3::new(1.0, 1.0, 1.0).normalize(),
        Vec3::new(-1.0, 0.5, -0.2).normalize(),
    ];
    for direction in directions {
        let view_pos = view.transform_point3(light + direction * 3.0);
        let front = paraboloid_uv(view_pos, true);
        let back = paraboloid_uv(view_pos, false);
        assert!(front.is_some() || back.is_some(), "{direction} not covered");
        for uv in front.into_iter().chain(back) {
            assert!(uv.cmpge(Vec2::splat(-EPSILON)).all());
            assert!(uv.cmple(Vec2::splat(1.0 + EPSILON)).all());
        }
    }
}

#[test]
fn packed_lights_separate_kinds_and_keep_directions() {
    let mut scene = Scene::new();
    let down = Vec3::new(0.0, -1.0, 0.2).normalize();
    let sun = scene.spawn_directional_light(down, DirectionalLight::new(Vec3::ONE));
    let lamp = scene.spawn_point_light(Vec3::new(0.0, 2.0, 0.0), PointLight::new(Vec3::ONE, 10.0));

    let packed = LightPacker::new(LightOverflowPolicy::DropFarthest).pack(&scene, &[sun, lamp], Vec3::ZERO);
    assert_eq!(packed.point.len(), 1);
    assert_eq!(packed.point[0].entity, lamp);
    assert_eq!(packed.directional.len(), 1);
    assert!((packed.directional[0].direction - down).length() < 1e-4);
    assert_eq!(packed.point_raw()[0].position, [0.0, 2.0, 0.0]);
}

#[test]
fn drop_farthest_keeps_lights_near_the_camera() {
    let mut scene = Scene::new();
    let visible: Vec<_> = (0..MAX_POINT_LIGHTS + 4)
        .map(|i| {
            scene.spawn_point_light(
                Vec3::new(0.0, 0.0, -(i as f32)),
                PointLight::new(Vec3::ONE, 5.0).without_shadows(),
            )
        })
        .rev()
        .collect();

    let packed = LightPacker::new(LightOverflowPolicy::DropFarthest).pack(&scene, &visible, Vec3::ZERO);
    assert_eq!(packed.point.len(), MAX_POINT_LIGHTS);
    assert_eq!(packed.dropped_point, 4);
    assert!(packed
        .point
        .iter()
        .all(|p| p.position.z > -(MAX_POINT_LIGHTS as f32)));
}
