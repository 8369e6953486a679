//! The demo scene: a textured cube spinning over a floor quad.

use std::time::Duration;

use glam::{Quat, Vec3, Vec4};
use kiln_core::{Error, Result};
use kiln_renderer::{Drawable, DrawableTable, FrameDriver, Geometry, MaterialId};
use kiln_resources::{ImageData, MeshData};
use kiln_scene::{SharedTransform, Transform};
use tracing::info;

/// Radians per second.
const SPIN_SPEED: f32 = 0.8;

pub struct DemoScene {
    pub drawables: DrawableTable,
    pub cube_material: MaterialId,
    spin: SharedTransform,
    angle: f32,
    elapsed: f32,
}

impl DemoScene {
    pub fn build(driver: &mut FrameDriver) -> Result<Self> {
        let mut drawables = DrawableTable::new();

        let camera = driver.create_camera();
        if let Some(cam) = driver.camera_mut(camera) {
            let mut eye = Transform::new().with_position(Vec3::new(0.0, 1.5, 4.0));
            eye.look_at(Vec3::ZERO, Vec3::Y);
            cam.set_transform(eye);
            cam.set_perspective(60.0, 0.1, 100.0);
            cam.set_clear_color(Vec4::new(0.05, 0.05, 0.08, 1.0));
        }

        let backend = driver.context().backend().clone();
        let ctx = driver.context_mut();
        let program = ctx.default_program().clone();
        let cube_material = ctx.create_material(program)?;

        let spin = SharedTransform::new(Transform::new());
        let cube_geometry = Geometry::upload(backend.clone(), &MeshData::cube(1.0))?;
        let cube = drawables.insert(Drawable::mesh(cube_geometry, spin.clone()).with_material(cube_material));

        // The floor keeps the default material.
        let floor_geometry = Geometry::upload(backend, &MeshData::quad(6.0).with_color(Vec4::new(0.4, 0.4, 0.45, 1.0)))?;
        let floor_transform = Transform::new()
            .with_position(Vec3::new(0.0, -0.75, 0.0))
            .with_rotation(Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2));
        let floor = drawables.insert(Drawable::mesh(floor_geometry, floor_transform));

        driver.attach(camera, cube, &mut drawables)?;
        driver.attach(camera, floor, &mut drawables)?;

        // Until this lands the cube samples the default white texture.
        driver.loader().load(
            Some(cube),
            || ImageData::checkerboard(256, 32, [230, 120, 40, 255], [30, 30, 30, 255]).map_err(Error::from),
            move |image, ctx, _| {
                let texture = ctx.create_texture(&image)?;
                ctx.set_material_texture(cube_material, texture)?;
                info!("Checkerboard texture applied");
                Ok(())
            },
        );

        Ok(Self {
            drawables,
            cube_material,
            spin,
            angle: 0.0,
            elapsed: 0.0,
        })
    }

    /// Advance the animation. Touches only transforms and material
    /// properties, so no command buffer is re-recorded.
    pub fn tick(&mut self, driver: &mut FrameDriver, delta: Duration) {
        let dt = delta.as_secs_f32();
        self.angle = (self.angle + SPIN_SPEED * dt) % std::f32::consts::TAU;
        self.elapsed += dt;
        let angle = self.angle;
        self.spin.update(|t| t.rotation = Quat::from_rotation_y(angle));

        let pulse = 0.85 + 0.15 * self.elapsed.sin();
        if let Some(material) = driver.context_mut().material_mut(self.cube_material) {
            material.set_color("base_color", Vec4::new(pulse, pulse, pulse, 1.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::EngineConfig;
    use kiln_renderer::RenderContext;
    use kiln_rhi::RhiResult;
    use kiln_rhi::headless::HeadlessBackend;
    use kiln_rhi::shader::{SPIRV_MAGIC, ShaderCache, ShaderCompiler, ShaderStage};

    struct StubCompiler;

    impl ShaderCompiler for StubCompiler {
        fn compile(&self, _stage: ShaderStage, _source: &str, _label: &str) -> RhiResult<Vec<u32>> {
            Ok(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0])
        }
    }

    #[test]
    fn test_demo_runs_headless() {
        let backend = HeadlessBackend::new();
        let config = EngineConfig::default();
        let ctx = RenderContext::with_shader_cache(
            backend.clone(),
            ShaderCache::disabled(Box::new(StubCompiler)),
            config.frames.frames_in_flight,
        )
        .unwrap();
        let mut driver = FrameDriver::with_context(ctx, &config, 640, 480).unwrap();
        let mut scene = DemoScene::build(&mut driver).unwrap();
        let epoch = driver.context().material(scene.cube_material).unwrap().binding_epoch();

        for _ in 0..500 {
            scene.tick(&mut driver, Duration::from_millis(16));
            driver.draw_frame(&mut scene.drawables).unwrap();
            if driver.loader().pending() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        driver.draw_frame(&mut scene.drawables).unwrap();

        assert_eq!(driver.loader().pending(), 0);
        assert_eq!(driver.context().material(scene.cube_material).unwrap().binding_epoch(), epoch + 1);
        assert_eq!(driver.camera(driver.render_order()[0]).unwrap().draw_list().len(), 2);
        assert_eq!(backend.stats().in_flight_rerecords, 0);
    }
}
