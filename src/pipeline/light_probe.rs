//! Light-probe capture
//!
//! A probe is captured twice per request: an atmosphere-only pass fills
//! LIGHT_PROBE_ATMOSPHERE (the ambient source for the second pass), then the
//! full scene is rendered into the probe cube. The cube is prefiltered into
//! a second cube whose lower mips hold rougher reflections.

use std::f32::consts::PI;

use glam::{Mat4, Vec2, Vec3};

use super::postprocess::slot;
use super::Renderer;
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::resources::{AttachOptions, RenderTargetSlot, Texture};
use crate::scene::{LightProbe, Scene, Transform};
use crate::AntiAliasing;

/// Temporary caching the cube freed by the last prefilter
pub const TEMP_CUBE: &str = "temp_cube";
pub const PROBE_FOV: f32 = 90.0;

/// Camera Euler angles for the faces +X, -X, +Y, -Y, +Z, -Z
pub const FACE_ROTATIONS: [Vec3; 6] = [
    Vec3::new(0.0, PI * 1.5, 0.0),
    Vec3::new(0.0, PI * 0.5, 0.0),
    Vec3::new(PI * -0.5, PI, 0.0),
    Vec3::new(PI * 0.5, PI, 0.0),
    Vec3::new(0.0, PI, 0.0),
    Vec3::new(0.0, 0.0, 0.0),
];

/// Rows of the matrices mapping face coordinates (s, t, 1) to a direction
const FACE_MATRIX_ROWS: [[[f32; 4]; 4]; 6] = [
    [[0.0, 0.0, 1.0, 0.0], [0.0, 1.0, 0.0, 0.0], [-1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
    [[0.0, 0.0, -1.0, 0.0], [0.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
    [[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, -1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
    [[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, -1.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
    [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
    [[-1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, -1.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
];

pub fn face_matrix(face: usize) -> Mat4 {
    Mat4::from_cols_array_2d(&FACE_MATRIX_ROWS[face]).transpose()
}

/// Renderer state overridden while a probe is captured
struct SavedState {
    transform: Transform,
    fov: f32,
    aspect: f32,
    anti_aliasing: AntiAliasing,
    motion_blur: bool,
    render_skeletal: bool,
}

impl Renderer {
    /// Capture every probe that is not up to date.
    pub fn render_light_probes(&mut self, ctx: &mut RenderContext, scene: &mut Scene) -> RenderResult<()> {
        for index in 0..scene.light_probes.len() {
            if !scene.light_probes[index].captured {
                self.render_light_probe(ctx, scene, index)?;
            }
        }
        Ok(())
    }

    /// Capture and prefilter one probe.
    pub fn render_light_probe(&mut self, ctx: &mut RenderContext, scene: &mut Scene, index: usize) -> RenderResult<()> {
        let probe = scene
            .light_probes
            .get_mut(index)
            .ok_or_else(|| RenderError::MissingResource(format!("light probe {}", index)))?;
        log::info!("Capturing light probe {}", probe.name);
        let position = probe.position();
        let name = probe.name.clone();
        let capture = match probe.texture_probe.take() {
            Some(texture) => texture,
            None => Texture::create(ctx.gpu(), LightProbe::cube_descriptor(&name), None)?,
        };

        let saved = self.begin_capture(scene);
        let result = self.capture_faces(ctx, scene, position, &capture);
        self.end_capture(scene, saved);
        if let Err(err) = result {
            capture.destroy(ctx.gpu());
            return Err(err);
        }

        let prefiltered = match self.prefilter(ctx, &name, &capture) {
            Ok(texture) => texture,
            Err(err) => {
                capture.destroy(ctx.gpu());
                return Err(err);
            }
        };
        ctx.render_targets.insert_temporary(ctx.backend.as_dyn_mut(), TEMP_CUBE, capture);
        if let Some(probe) = scene.light_probes.get_mut(index) {
            probe.texture_probe = Some(prefiltered);
            probe.captured = true;
        }
        Ok(())
    }

    fn begin_capture(&mut self, scene: &mut Scene) -> SavedState {
        let camera = &mut scene.camera;
        let saved = SavedState {
            transform: camera.transform,
            fov: camera.fov,
            aspect: camera.aspect,
            anti_aliasing: self.postprocess.settings.anti_aliasing,
            motion_blur: self.postprocess.settings.is_render_motion_blur,
            render_skeletal: self.options.is_render_skeletal,
        };
        self.postprocess.settings.anti_aliasing = AntiAliasing::None;
        self.postprocess.settings.is_render_motion_blur = false;
        self.options.is_render_skeletal = false;
        camera.update_projection(PROBE_FOV, 1.0);
        saved
    }

    fn end_capture(&mut self, scene: &mut Scene, saved: SavedState) {
        self.capture_mode = None;
        self.postprocess.settings.anti_aliasing = saved.anti_aliasing;
        self.postprocess.settings.is_render_motion_blur = saved.motion_blur;
        self.options.is_render_skeletal = saved.render_skeletal;
        let camera = &mut scene.camera;
        camera.transform = saved.transform;
        camera.update_projection(saved.fov, saved.aspect);
        camera.reset_history();
        camera.update(self.postprocess.jitter());
    }

    /// Atmosphere-only pass into LIGHT_PROBE_ATMOSPHERE, then the full scene
    /// into `capture`.
    fn capture_faces(
        &mut self,
        ctx: &mut RenderContext,
        scene: &mut Scene,
        position: Vec3,
        capture: &Texture,
    ) -> RenderResult<()> {
        let atmosphere_probe = slot(ctx, RenderTargetSlot::LightProbeAtmosphere)?;
        for (mode, target) in [
            (CaptureMode::AtmosphereOnly, &atmosphere_probe),
            (CaptureMode::Scene, capture),
        ] {
            self.capture_mode = Some(mode);
            for (face, rotation) in FACE_ROTATIONS.iter().enumerate() {
                let camera = &mut scene.camera;
                camera.transform.set_position(position);
                camera.transform.set_rotation(*rotation);
                camera.reset_history();
                camera.update(Vec2::ZERO);
                self.render_scene(ctx, scene, 0.0)?;

                let hdr = self.hdr_output(ctx)?;
                let gpu = ctx.backend.as_dyn_mut();
                let src = ctx.framebuffers.bind_framebuffer(gpu, &[&hdr], None)?;
                let dst = ctx.framebuffers.bind_framebuffer_with(
                    gpu,
                    &[target],
                    None,
                    AttachOptions::face(face as u32),
                )?;
                ctx.framebuffers.mirror_from(gpu, src, dst)?;
            }
            target.generate_mipmap(ctx.gpu())?;
        }
        Ok(())
    }

    /// Convolve every face and mip of `capture` into a reused cube.
    fn prefilter(&self, ctx: &mut RenderContext, name: &str, capture: &Texture) -> RenderResult<Texture> {
        let reusable = match ctx.render_targets.take_temporary(TEMP_CUBE) {
            Some(cached) if cached.desc.width == capture.desc.width && cached.desc.format == capture.desc.format => {
                Some(cached)
            }
            Some(stale) => {
                stale.destroy(ctx.gpu());
                None
            }
            None => None,
        };
        let target = match reusable {
            Some(texture) => texture,
            None => Texture::create(
                ctx.gpu(),
                LightProbe::cube_descriptor(&format!("{}.prefiltered", name)),
                None,
            )?,
        };
        for face in 0..6u32 {
            for level in 0..target.desc.mip_levels() {
                let result = self.postprocess.render_cube_convolution(
                    ctx,
                    capture,
                    &target,
                    face,
                    level,
                    face_matrix(face as usize),
                );
                if let Err(err) = result {
                    target.destroy(ctx.gpu());
                    return Err(err);
                }
            }
        }
        Ok(target)
    }
}

/// Which scene content a probe capture renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    AtmosphereOnly,
    Scene,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_matrices_are_rotations() {
        for face in 0..6 {
            let m = face_matrix(face);
            assert!((m.determinant().abs() - 1.0).abs() < 1e-6);
            assert!((m * m.transpose()).abs_diff_eq(Mat4::IDENTITY, 1e-6));
        }
    }

    #[test]
    fn test_face_matrices_look_down_each_axis() {
        let forward = |face: usize| face_matrix(face).transform_vector3(Vec3::Z);
        assert_eq!(forward(0), Vec3::X);
        assert_eq!(forward(1), -Vec3::X);
        assert_eq!(forward(2), Vec3::Y);
        assert_eq!(forward(3), -Vec3::Y);
        assert_eq!(forward(4), Vec3::Z);
        assert_eq!(forward(5), -Vec3::Z);
    }
}
