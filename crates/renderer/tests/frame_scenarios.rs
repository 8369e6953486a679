//! End-to-end frame scenarios on the headless backend.

mod common;

use std::time::Duration;

use kiln_core::{EngineConfig, Error};
use kiln_renderer::{DrawableTable, FrameDriver, FrameOutcome, RenderTargetDesc};
use kiln_resources::ImageData;
use kiln_rhi::command::Command;
use kiln_rhi::headless::{HeadlessBackend, HeadlessEvent};
use kiln_rhi::render_pass::ClearFlags;
use kiln_rhi::vk;

use common::{cube, draw_round, driver, driver_with, material};

#[test]
fn test_draw_order_follows_render_queue() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();

    let late = material(&mut driver, 10);
    let early = material(&mut driver, 0);
    let first_late = cube(&driver, &mut drawables, Some(late));
    let early_drawable = cube(&driver, &mut drawables, Some(early));
    let second_late = cube(&driver, &mut drawables, Some(late));
    for id in [first_late, early_drawable, second_late] {
        driver.attach(camera, id, &mut drawables).unwrap();
    }

    driver.draw_frame(&mut drawables).unwrap();
    let camera_ref = driver.camera(camera).unwrap();
    let expected: Vec<_> = [early_drawable, first_late, second_late]
        .iter()
        .map(|id| camera_ref.command_buffer(*id).unwrap())
        .collect();
    assert_eq!(camera_ref.draw_list(), expected.as_slice());

    // Equal queues keep registration order across frames.
    draw_round(&mut driver, &mut drawables);
    assert_eq!(driver.camera(camera).unwrap().draw_list(), expected.as_slice());
}

#[test]
fn test_drawable_without_material_draws_first() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();

    let negative = material(&mut driver, -5);
    let with_material = cube(&driver, &mut drawables, Some(negative));
    let bare = cube(&driver, &mut drawables, None);
    driver.attach(camera, with_material, &mut drawables).unwrap();
    driver.attach(camera, bare, &mut drawables).unwrap();

    driver.draw_frame(&mut drawables).unwrap();
    let camera = driver.camera(camera).unwrap();
    assert_eq!(camera.draw_list()[0], camera.command_buffer(bare).unwrap());
}

#[test]
fn test_primary_executes_camera_secondaries() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let a = cube(&driver, &mut drawables, None);
    driver.attach(camera, a, &mut drawables).unwrap();

    driver.draw_frame(&mut drawables).unwrap();
    let secondary = driver.camera(camera).unwrap().command_buffer(a).unwrap();
    let pass = driver.camera(camera).unwrap().render_pass().unwrap().handle;
    let primary = (0..driver.swapchain().image_count() as usize)
        .filter_map(|i| driver.primary(i))
        .find_map(|cmd| backend.recording(cmd))
        .unwrap();
    assert_eq!(primary.executed(), vec![secondary]);
    assert_eq!(primary.render_passes(), vec![pass]);
    assert!(matches!(primary.commands().last(), Some(Command::EndRenderPass)));
}

#[test]
fn test_texture_swap_rerecords_only_that_secondary() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();

    let swapped = material(&mut driver, 0);
    let untouched = material(&mut driver, 0);
    let a = cube(&driver, &mut drawables, Some(swapped));
    let b = cube(&driver, &mut drawables, Some(untouched));
    driver.attach(camera, a, &mut drawables).unwrap();
    driver.attach(camera, b, &mut drawables).unwrap();
    draw_round(&mut driver, &mut drawables);

    let before = backend.stats();
    let primaries_before = driver.stats().primary_rebuilds;
    let cmd_b = driver.camera(camera).unwrap().command_buffer(b).unwrap();
    let recording_b = backend.recording(cmd_b).unwrap().commands().len();

    let checker = ImageData::checkerboard(8, 2, [0, 0, 0, 255], [255, 255, 255, 255]).unwrap();
    let texture = driver.context().create_texture(&checker).unwrap();
    assert!(driver.context_mut().set_material_texture(swapped, texture).unwrap());
    draw_round(&mut driver, &mut drawables);

    let after = backend.stats();
    assert_eq!(after.secondary_records, before.secondary_records + 1);
    assert_eq!(driver.stats().primary_rebuilds, primaries_before);
    assert_eq!(after.in_flight_rerecords, 0);
    assert_eq!(backend.recording(cmd_b).unwrap().commands().len(), recording_b);

    // The re-recorded secondary binds the material's new set.
    let cmd_a = driver.camera(camera).unwrap().command_buffer(a).unwrap();
    let set = driver.context().material(swapped).unwrap().descriptor_set();
    let binds_new_set = backend.recording(cmd_a).unwrap().commands().iter().any(|command| {
        matches!(command, Command::BindDescriptorSets { sets, .. } if sets.first() == Some(&set))
    });
    assert!(binds_new_set);
}

#[test]
fn test_strict_reuse_rerecords_primaries_after_secondary_change() {
    let backend = HeadlessBackend::new();
    let mut config = EngineConfig::default();
    config.frames.strict_command_reuse = true;
    let mut driver = driver_with(&backend, &config);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let swapped = material(&mut driver, 0);
    let a = cube(&driver, &mut drawables, Some(swapped));
    driver.attach(camera, a, &mut drawables).unwrap();
    draw_round(&mut driver, &mut drawables);
    let primaries_before = driver.stats().primary_rebuilds;

    let texture = driver
        .context()
        .create_texture(&ImageData::solid(4, 4, [0, 255, 0, 255]).unwrap())
        .unwrap();
    driver.context_mut().set_material_texture(swapped, texture).unwrap();
    draw_round(&mut driver, &mut drawables);

    let image_count = driver.swapchain().image_count() as u64;
    assert_eq!(driver.stats().primary_rebuilds, primaries_before + image_count);
    assert_eq!(backend.stats().in_flight_rerecords, 0);
}

#[test]
fn test_property_change_records_nothing() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let tinted = material(&mut driver, 0);
    let a = cube(&driver, &mut drawables, Some(tinted));
    driver.attach(camera, a, &mut drawables).unwrap();
    draw_round(&mut driver, &mut drawables);
    let before = backend.stats();

    let color = glam::Vec4::new(1.0, 0.0, 0.0, 1.0);
    assert!(driver.context_mut().material_mut(tinted).unwrap().set_color("base_color", color));
    draw_round(&mut driver, &mut drawables);

    let after = backend.stats();
    assert_eq!(after.secondary_records, before.secondary_records);
    assert_eq!(after.primary_records, before.primary_records);
}

#[test]
fn test_resize_rebuilds_pass_and_pipelines() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let a = cube(&driver, &mut drawables, None);
    driver.attach(camera, a, &mut drawables).unwrap();
    driver.draw_frame(&mut drawables).unwrap();

    let old_pass = driver.camera(camera).unwrap().render_pass().unwrap().clone();
    assert_eq!(old_pass.extent.width, 800);
    let before = backend.stats();
    assert_eq!(driver.context().pipelines().len(), 1);

    backend.set_surface_extent(1280, 720);
    driver.on_resize(1280, 720);
    assert_eq!(driver.draw_frame(&mut drawables).unwrap(), FrameOutcome::Presented);

    let new_pass = driver.camera(camera).unwrap().render_pass().unwrap().clone();
    assert_ne!(new_pass.id, old_pass.id);
    assert_eq!((new_pass.extent.width, new_pass.extent.height), (1280, 720));

    let after = backend.stats();
    assert_eq!(after.pipelines_destroyed, before.pipelines_destroyed + 1);
    assert_eq!(after.pipelines_created, before.pipelines_created + 1);
    assert_eq!(after.secondary_records, before.secondary_records + 1);
    assert_eq!(driver.context().pipelines().len(), 1);
    assert_eq!(driver.context().render_passes().len(), 1);
    assert_eq!(after.in_flight_rerecords, 0);
}

#[test]
fn test_cameras_share_render_pass_and_pipeline() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let first = driver.create_camera();
    let second = driver.create_camera();
    driver.camera_mut(second).unwrap().set_depth(1);
    let a = cube(&driver, &mut drawables, None);
    let b = cube(&driver, &mut drawables, None);
    driver.attach(first, a, &mut drawables).unwrap();
    driver.attach(second, b, &mut drawables).unwrap();

    driver.draw_frame(&mut drawables).unwrap();
    let pass_a = driver.camera(first).unwrap().render_pass().unwrap().clone();
    let pass_b = driver.camera(second).unwrap().render_pass().unwrap().clone();
    assert_eq!(pass_a.handle, pass_b.handle);
    let key = *driver.camera(first).unwrap().render_pass_key().unwrap();
    assert_eq!(driver.context().render_passes().refcount(&key), 2);
    assert_eq!(backend.stats().render_passes_created, 1);
    assert_eq!(backend.stats().pipelines_created, 1);
    assert_eq!(driver.context().pipelines().builds(), 1);
    assert_eq!(driver.render_order(), vec![first, second]);
}

#[test]
fn test_removed_drawable_leaves_draw_list() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let a = cube(&driver, &mut drawables, None);
    let b = cube(&driver, &mut drawables, None);
    driver.attach(camera, a, &mut drawables).unwrap();
    driver.attach(camera, b, &mut drawables).unwrap();
    driver.draw_frame(&mut drawables).unwrap();
    let rebuilds = driver.stats().primary_rebuilds;

    drawables.remove(a);
    driver.draw_frame(&mut drawables).unwrap();
    let camera = driver.camera(camera).unwrap();
    assert_eq!(camera.renderer_count(), 1);
    assert_eq!(camera.draw_list(), &[camera.command_buffer(b).unwrap()]);
    assert_eq!(driver.stats().primary_rebuilds, rebuilds + 1);
}

#[test]
fn test_loaded_texture_reaches_material() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let target = material(&mut driver, 0);
    let a = cube(&driver, &mut drawables, Some(target));
    driver.attach(camera, a, &mut drawables).unwrap();
    driver.draw_frame(&mut drawables).unwrap();
    let epoch = driver.context().material(target).unwrap().binding_epoch();

    driver.loader().load(
        Some(a),
        || ImageData::checkerboard(16, 4, [255, 0, 0, 255], [0, 0, 255, 255]).map_err(Error::from),
        move |image, ctx, _| {
            let texture = ctx.create_texture(&image)?;
            ctx.set_material_texture(target, texture)?;
            Ok(())
        },
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while driver.loader().pending() > 0 && std::time::Instant::now() < deadline {
        driver.draw_frame(&mut drawables).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(driver.loader().pending(), 0);
    assert_eq!(driver.context().material(target).unwrap().binding_epoch(), epoch + 1);

    // The next frame picks up the new binding.
    driver.draw_frame(&mut drawables).unwrap();
    assert_eq!(backend.stats().in_flight_rerecords, 0);
    let cmd = driver.camera(camera).unwrap().command_buffer(a).unwrap();
    let set = driver.context().material(target).unwrap().descriptor_set();
    assert!(backend.recording(cmd).unwrap().commands().iter().any(
        |command| matches!(command, Command::BindDescriptorSets { sets, .. } if sets.first() == Some(&set))
    ));
}

fn assert_images_presentable(backend: &HeadlessBackend, driver: &FrameDriver) {
    for image in backend.swapchain_images(driver.swapchain().handle()) {
        assert_eq!(
            backend.image_layout(image),
            Some(vk::ImageLayout::PRESENT_SRC_KHR)
        );
    }
}

#[test]
fn test_loading_surface_pass_starts_from_presentable_layout() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    driver
        .camera_mut(camera)
        .unwrap()
        .set_clear_flags(ClearFlags::DepthOnly);
    let a = cube(&driver, &mut drawables, None);
    driver.attach(camera, a, &mut drawables).unwrap();

    draw_round(&mut driver, &mut drawables);
    draw_round(&mut driver, &mut drawables);
    assert_eq!(backend.stats().layout_mismatches, 0);
    assert_images_presentable(&backend, &driver);

    let primary = backend.recording(driver.primary(0).unwrap()).unwrap();
    assert!(matches!(
        primary.commands().first(),
        Some(Command::ImageBarrier {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..
        })
    ));

    // A rebuilt swapchain hands out fresh undefined images again.
    backend.set_surface_extent(1024, 768);
    driver.on_resize(1024, 768);
    draw_round(&mut driver, &mut drawables);
    assert_eq!(driver.stats().swapchain_rebuilds, 1);
    assert_eq!(backend.stats().layout_mismatches, 0);
    assert_images_presentable(&backend, &driver);
}

#[test]
fn test_overlay_camera_loads_after_clearing_camera() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let _base = driver.create_camera();
    let overlay = driver.create_camera();
    let camera = driver.camera_mut(overlay).unwrap();
    camera.set_depth(1);
    camera.set_clear_flags(ClearFlags::Nothing);

    draw_round(&mut driver, &mut drawables);
    assert_eq!(backend.stats().layout_mismatches, 0);
    assert_images_presentable(&backend, &driver);

    // The first pass clears, so no barrier is needed.
    let primary = backend.recording(driver.primary(0).unwrap()).unwrap();
    assert!(
        !primary
            .commands()
            .iter()
            .any(|c| matches!(c, Command::ImageBarrier { .. }))
    );
    assert_eq!(primary.render_passes().len(), 2);
}

#[test]
fn test_removed_renderer_is_freed_after_its_last_frame() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    assert_eq!(driver.swapchain().image_count(), 3);
    let mut drawables = DrawableTable::new();
    let camera = driver.create_camera();
    let a = cube(&driver, &mut drawables, None);
    driver.attach(camera, a, &mut drawables).unwrap();
    backend.set_auto_complete(false);

    // Frames 1 and 2 stay on the GPU.
    driver.draw_frame(&mut drawables).unwrap();
    driver.draw_frame(&mut drawables).unwrap();
    let secondary = driver.camera(camera).unwrap().command_buffer(a).unwrap();
    let fences: Vec<vk::Fence> = backend
        .events()
        .iter()
        .filter_map(|event| match event {
            HeadlessEvent::Submit { fence, .. } => Some(*fence),
            _ => None,
        })
        .collect();
    assert_eq!(fences.len(), 2);

    assert!(driver.detach(a, &mut drawables));
    assert!(driver.context().pending_releases() > 0);

    // Frame 3 reuses frame 1's slot; frame 2 still executes the secondary.
    backend.signal_fence(fences[0]);
    driver.draw_frame(&mut drawables).unwrap();
    assert_eq!(backend.pending_submissions(), 2);
    assert!(!backend.events().contains(&HeadlessEvent::FreeCommandBuffer(secondary)));

    backend.complete_pending();
    driver.draw_frame(&mut drawables).unwrap();
    assert!(backend.events().contains(&HeadlessEvent::FreeCommandBuffer(secondary)));
    assert_eq!(driver.context().pending_releases(), 0);

    let stats = backend.stats();
    assert_eq!(stats.in_flight_frees, 0);
    assert_eq!(stats.in_flight_rerecords, 0);
    assert_eq!(stats.invalid_destroys, 0);
    backend.set_auto_complete(true);
}

#[test]
fn test_fatal_loader_error_ends_the_frame() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    driver.create_camera();
    driver.draw_frame(&mut drawables).unwrap();

    driver.loader().load(
        None,
        || Ok(()),
        |(), _, _| Err(Error::Device("device lost".into())),
    );

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let error = loop {
        match driver.draw_frame(&mut drawables) {
            Err(e) => break e,
            Ok(_) => {
                assert!(std::time::Instant::now() < deadline, "completion never ran");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    };
    assert!(error.is_fatal());
    assert!(matches!(error, Error::Device(_)));
}

#[test]
fn test_recoverable_loader_error_keeps_rendering() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    driver.create_camera();

    driver.loader().load(
        None,
        || Err::<(), _>(Error::Asset("missing.png".into())),
        |(), _, _| Ok(()),
    );
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while driver.loader().pending() > 0 && std::time::Instant::now() < deadline {
        assert!(driver.draw_frame(&mut drawables).is_ok());
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(driver.loader().pending(), 0);
    assert_eq!(driver.draw_frame(&mut drawables).unwrap(), FrameOutcome::Presented);
}

#[test]
fn test_multisampled_target_feeds_surface_camera() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    let target = driver
        .context_mut()
        .create_render_target(RenderTargetDesc::new(128, 128).with_samples(4))
        .unwrap();
    let offscreen = driver.create_camera();
    let camera = driver.camera_mut(offscreen).unwrap();
    camera.set_depth(-1);
    camera.set_target(Some(target.clone()));
    let onscreen = driver.create_camera();

    let sampled = material(&mut driver, 0);
    driver
        .context_mut()
        .set_material_texture(sampled, target.texture())
        .unwrap();
    let a = cube(&driver, &mut drawables, None);
    let b = cube(&driver, &mut drawables, Some(sampled));
    driver.attach(offscreen, a, &mut drawables).unwrap();
    driver.attach(onscreen, b, &mut drawables).unwrap();

    draw_round(&mut driver, &mut drawables);
    let pass = driver.camera(offscreen).unwrap().render_pass().unwrap().clone();
    assert_eq!(pass.samples, 4);
    assert_eq!(driver.camera(onscreen).unwrap().render_pass().unwrap().samples, 1);
    assert_eq!(backend.stats().layout_mismatches, 0);
    assert_eq!(
        backend.image_layout(target.texture().image().handle()),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert_eq!(driver.context().pipelines().len(), 2);
}

#[test]
fn test_resize_to_zero_surface_waits_for_a_real_size() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();
    driver.create_camera();
    driver.draw_frame(&mut drawables).unwrap();
    let generation = driver.swapchain().generation();
    let acquires = backend.stats().acquires;

    // The window reports a size but the surface has already gone to zero.
    backend.set_surface_extent(0, 0);
    driver.on_resize(640, 480);
    assert_eq!(driver.draw_frame(&mut drawables).unwrap(), FrameOutcome::Paused);
    assert_eq!(driver.draw_frame(&mut drawables).unwrap(), FrameOutcome::Paused);
    assert_eq!(driver.swapchain().generation(), generation);
    assert_eq!(backend.stats().acquires, acquires);
    assert_eq!(driver.stats().swapchain_rebuilds, 0);

    backend.set_surface_extent(640, 480);
    assert_eq!(driver.draw_frame(&mut drawables).unwrap(), FrameOutcome::Presented);
    assert_eq!(driver.swapchain().extent().width, 640);
    assert_eq!(driver.stats().swapchain_rebuilds, 1);
}

#[test]
fn test_frame_without_surface_camera_presents_valid_image() {
    let backend = HeadlessBackend::new();
    let mut driver = driver(&backend);
    let mut drawables = DrawableTable::new();

    draw_round(&mut driver, &mut drawables);
    assert_eq!(backend.stats().layout_mismatches, 0);
    assert_images_presentable(&backend, &driver);

    // An off-screen camera alone leaves the swapchain image untouched too.
    let target = driver
        .context_mut()
        .create_render_target(RenderTargetDesc::new(32, 32))
        .unwrap();
    let camera = driver.create_camera();
    driver.camera_mut(camera).unwrap().set_target(Some(target));
    draw_round(&mut driver, &mut drawables);
    assert_eq!(backend.stats().layout_mismatches, 0);
    let primary = backend.recording(driver.primary(0).unwrap()).unwrap();
    assert!(matches!(
        primary.commands().last(),
        Some(Command::ImageBarrier {
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..
        })
    ));
}
