//! INI configuration loading and logger setup

use std::path::Path;

use ini::Ini;

use crate::error::{RenderError, RenderResult};
use crate::{AntiAliasing, RendererConfig, RenderingType};

/// Load `path`; a missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> RenderResult<RendererConfig> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(RendererConfig::default());
    }
    let ini = Ini::load_from_file(path)
        .map_err(|e| RenderError::Config(format!("{}: {}", path.display(), e)))?;
    config_from_ini(&ini)
}

pub fn parse_config(source: &str) -> RenderResult<RendererConfig> {
    let ini = Ini::load_from_str(source).map_err(|e| RenderError::Config(e.to_string()))?;
    config_from_ini(&ini)
}

fn value<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|s| s.get(key))
        .map(|v| v.split(';').next().unwrap_or(v).trim())
}

fn parse<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str, default: T) -> RenderResult<T> {
    match value(ini, section, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| RenderError::Config(format!("[{}] {} = '{}'", section, key, raw))),
    }
}

fn config_from_ini(ini: &Ini) -> RenderResult<RendererConfig> {
    let defaults = RendererConfig::default();
    let rendering_type = match value(ini, "Renderer", "rendering_type") {
        None => defaults.rendering_type,
        Some(raw) => RenderingType::from_name(raw)
            .ok_or_else(|| RenderError::Config(format!("rendering_type = '{}'", raw)))?,
    };
    let anti_aliasing = match value(ini, "Renderer", "anti_aliasing") {
        None => defaults.anti_aliasing,
        Some(raw) => AntiAliasing::from_name(raw)
            .ok_or_else(|| RenderError::Config(format!("anti_aliasing = '{}'", raw)))?,
    };
    let log_level = match value(ini, "Log", "level") {
        None => defaults.log_level,
        Some(raw) => raw
            .parse()
            .map_err(|_| RenderError::Config(format!("[Log] level = '{}'", raw)))?,
    };
    let config = RendererConfig {
        title: defaults.title.clone(),
        project_path: value(ini, "Project", "path")
            .map(Into::into)
            .unwrap_or(defaults.project_path.clone()),
        log_level,
        width: parse(ini, "Window", "width", defaults.width)?,
        height: parse(ini, "Window", "height", defaults.height)?,
        vsync: parse(ini, "Window", "vsync", defaults.vsync)?,
        fullscreen: parse(ini, "Window", "fullscreen", defaults.fullscreen)?,
        rendering_type,
        anti_aliasing,
        max_point_lights: parse(ini, "Renderer", "max_point_lights", defaults.max_point_lights)?,
        gpu_particles: parse(ini, "Renderer", "gpu_particles", defaults.gpu_particles)?,
    };
    if config.width == 0 || config.height == 0 {
        return Err(RenderError::Config(format!(
            "window size {}x{}",
            config.width, config.height
        )));
    }
    Ok(config)
}

/// Initialise `env_logger`; `RUST_LOG` overrides the configured level.
pub fn init_logging(level: log::LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            "[Project]\npath = Projects/sample\n[Log]\nlevel = debug\n[Window]\nwidth = 640\nheight = 480\nvsync = false\n[Renderer]\nrendering_type = forward ; comment\nanti_aliasing = msaa\n",
        )
        .unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert!(!config.vsync);
        assert_eq!(config.rendering_type, RenderingType::Forward);
        assert_eq!(config.anti_aliasing, AntiAliasing::Msaa);
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.project_path, std::path::PathBuf::from("Projects/sample"));
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = parse_config("[Window]\nwidth = 800\n").unwrap();
        assert_eq!(config.width, 800);
        assert_eq!(config.height, RendererConfig::default().height);
        assert_eq!(config.anti_aliasing, AntiAliasing::Taa);
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        assert!(matches!(
            parse_config("[Window]\nwidth = wide\n"),
            Err(RenderError::Config(_))
        ));
        assert!(parse_config("[Renderer]\nanti_aliasing = fxaa\n").is_err());
    }
}
