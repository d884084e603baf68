//! Compiled materials and material instances
//!
//! A [`Material`] is a linked program for one (shader, macros) pair. A
//! [`MaterialInstance`] holds uniform values for the program's declared
//! uniforms (its material components) and the texture unit of every sampler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use glam::{Mat2, Mat3, Mat4, Vec2, Vec3, Vec4};
use ini::Ini;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use super::shader::ShaderLibrary;
use super::texture::{Texture, TextureStore, FLAT_NORMAL};
use crate::backend::*;
use crate::error::{RenderError, RenderResult};

new_key_type! {
    /// Id of a material instance owned by a [`MaterialStore`]
    pub struct MaterialInstanceId;
}

/// Name of the instance used when a render info carries none
pub const DEFAULT_MATERIAL_INSTANCE: &str = "default";

/// Define that routes an instance to the translucent pass
pub const TRANSPARENT_MATERIAL: &str = "TRANSPARENT_MATERIAL";

/// Texture bound to a sampler uniform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub name: String,
    pub handle: TextureHandle,
}

/// Value stored for one uniform
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    /// Binds nothing
    Absent,
    Bool(bool),
    Int(i32),
    UInt(u32),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    IVec2([i32; 2]),
    IVec3([i32; 3]),
    IVec4([i32; 4]),
    Mat2(Mat2),
    Mat3(Mat3),
    Mat4(Mat4),
    Vec3Array(Vec<Vec3>),
    Vec4Array(Vec<Vec4>),
    Mat4Array(Vec<Mat4>),
    Texture(TextureBinding),
}

impl UniformValue {
    /// Value a newly declared uniform starts with: zero scalars, all-ones
    /// vectors, identity matrices and the named default textures.
    pub fn default_for(name: &str, kind: UniformKind, count: u32, textures: &TextureStore) -> Self {
        let count = count.max(1) as usize;
        match kind {
            UniformKind::Bool => UniformValue::Bool(false),
            UniformKind::Int => UniformValue::Int(0),
            UniformKind::UInt => UniformValue::UInt(0),
            UniformKind::Float => UniformValue::Float(0.0),
            UniformKind::Vec2 => UniformValue::Vec2(Vec2::ONE),
            UniformKind::Vec3 if count > 1 => UniformValue::Vec3Array(vec![Vec3::ONE; count]),
            UniformKind::Vec3 => UniformValue::Vec3(Vec3::ONE),
            UniformKind::Vec4 if count > 1 => UniformValue::Vec4Array(vec![Vec4::ONE; count]),
            UniformKind::Vec4 => UniformValue::Vec4(Vec4::ONE),
            UniformKind::IVec2 => UniformValue::IVec2([1; 2]),
            UniformKind::IVec3 => UniformValue::IVec3([1; 3]),
            UniformKind::IVec4 => UniformValue::IVec4([1; 4]),
            UniformKind::Mat2 => UniformValue::Mat2(Mat2::IDENTITY),
            UniformKind::Mat3 => UniformValue::Mat3(Mat3::IDENTITY),
            UniformKind::Mat4 if count > 1 => UniformValue::Mat4Array(vec![Mat4::IDENTITY; count]),
            UniformKind::Mat4 => UniformValue::Mat4(Mat4::IDENTITY),
            _ => {
                let texture = if kind.is_sampler() && name.contains("normal") {
                    textures.by_name(FLAT_NORMAL)
                } else {
                    textures.default_for(kind)
                };
                texture
                    .map(|t| {
                        UniformValue::Texture(TextureBinding {
                            name: t.name.clone(),
                            handle: t.handle,
                        })
                    })
                    .unwrap_or(UniformValue::Absent)
            }
        }
    }

    /// Whether this value can be stored for a uniform of `kind`.
    pub fn matches(&self, kind: UniformKind) -> bool {
        match self {
            UniformValue::Absent => true,
            UniformValue::Texture(_) => kind.is_sampler(),
            other => other.to_uniform_data().is_some_and(|data| data.matches(kind)),
        }
    }

    /// Backend payload of a non-texture value.
    pub fn to_uniform_data(&self) -> Option<UniformData> {
        Some(match self {
            UniformValue::Absent | UniformValue::Texture(_) => return None,
            UniformValue::Bool(v) => UniformData::Bool(*v),
            UniformValue::Int(v) => UniformData::Int(*v),
            UniformValue::UInt(v) => UniformData::UInt(*v),
            UniformValue::Float(v) => UniformData::Float(*v),
            UniformValue::Vec2(v) => UniformData::Vec2(v.to_array()),
            UniformValue::Vec3(v) => UniformData::Vec3(v.to_array()),
            UniformValue::Vec4(v) => UniformData::Vec4(v.to_array()),
            UniformValue::IVec2(v) => UniformData::IVec2(*v),
            UniformValue::IVec3(v) => UniformData::IVec3(*v),
            UniformValue::IVec4(v) => UniformData::IVec4(*v),
            UniformValue::Mat2(m) => UniformData::Mat2(m.to_cols_array()),
            UniformValue::Mat3(m) => UniformData::Mat3(m.to_cols_array()),
            UniformValue::Mat4(m) => UniformData::Mat4(m.to_cols_array()),
            UniformValue::Vec3Array(v) => UniformData::Vec3Array(v.iter().map(|x| x.to_array()).collect()),
            UniformValue::Vec4Array(v) => UniformData::Vec4Array(v.iter().map(|x| x.to_array()).collect()),
            UniformValue::Mat4Array(v) => {
                UniformData::Mat4Array(v.iter().map(|m| m.to_cols_array()).collect())
            }
        })
    }

    /// Parse a literal for a uniform of `kind`. Vectors and matrices accept
    /// comma or whitespace separated components, optionally bracketed.
    pub fn parse(kind: UniformKind, count: u32, text: &str) -> Result<Self, String> {
        let numbers = || -> Result<Vec<f32>, String> {
            text.split(|c: char| c == ',' || c.is_whitespace() || "[]()".contains(c))
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f32>().map_err(|_| format!("'{}' is not a number", s)))
                .collect()
        };
        let exact = |n: usize| -> Result<Vec<f32>, String> {
            let values = numbers()?;
            if values.len() == n {
                Ok(values)
            } else {
                Err(format!("expected {} components, got {}", n, values.len()))
            }
        };
        let ints = |n: usize| -> Result<Vec<i32>, String> {
            Ok(exact(n)?.into_iter().map(|v| v as i32).collect())
        };
        let count = count.max(1) as usize;
        Ok(match kind {
            UniformKind::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => UniformValue::Bool(true),
                "false" | "0" => UniformValue::Bool(false),
                other => return Err(format!("'{}' is not a bool", other)),
            },
            UniformKind::Int => UniformValue::Int(ints(1)?[0]),
            UniformKind::UInt => UniformValue::UInt(exact(1)?[0].max(0.0) as u32),
            UniformKind::Float => UniformValue::Float(exact(1)?[0]),
            UniformKind::Vec2 => UniformValue::Vec2(Vec2::from_slice(&exact(2)?)),
            UniformKind::Vec3 if count > 1 => UniformValue::Vec3Array(
                exact(3 * count)?.chunks_exact(3).map(Vec3::from_slice).collect(),
            ),
            UniformKind::Vec3 => UniformValue::Vec3(Vec3::from_slice(&exact(3)?)),
            UniformKind::Vec4 if count > 1 => UniformValue::Vec4Array(
                exact(4 * count)?.chunks_exact(4).map(Vec4::from_slice).collect(),
            ),
            UniformKind::Vec4 => UniformValue::Vec4(Vec4::from_slice(&exact(4)?)),
            UniformKind::IVec2 => {
                let v = ints(2)?;
                UniformValue::IVec2([v[0], v[1]])
            }
            UniformKind::IVec3 => {
                let v = ints(3)?;
                UniformValue::IVec3([v[0], v[1], v[2]])
            }
            UniformKind::IVec4 => {
                let v = ints(4)?;
                UniformValue::IVec4([v[0], v[1], v[2], v[3]])
            }
            UniformKind::Mat2 => UniformValue::Mat2(Mat2::from_cols_slice(&exact(4)?)),
            UniformKind::Mat3 => UniformValue::Mat3(Mat3::from_cols_slice(&exact(9)?)),
            UniformKind::Mat4 if count > 1 => UniformValue::Mat4Array(
                exact(16 * count)?.chunks_exact(16).map(Mat4::from_cols_slice).collect(),
            ),
            UniformKind::Mat4 => UniformValue::Mat4(Mat4::from_cols_slice(&exact(16)?)),
            _ => return Err("texture uniforms take a texture name".into()),
        })
    }

    /// Literal written to material-instance files.
    pub fn to_literal(&self) -> String {
        fn join<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
            values
                .into_iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            UniformValue::Absent => String::new(),
            UniformValue::Bool(v) => v.to_string(),
            UniformValue::Int(v) => v.to_string(),
            UniformValue::UInt(v) => v.to_string(),
            UniformValue::Float(v) => v.to_string(),
            UniformValue::Vec2(v) => join(v.to_array()),
            UniformValue::Vec3(v) => join(v.to_array()),
            UniformValue::Vec4(v) => join(v.to_array()),
            UniformValue::IVec2(v) => join(*v),
            UniformValue::IVec3(v) => join(*v),
            UniformValue::IVec4(v) => join(*v),
            UniformValue::Mat2(m) => join(m.to_cols_array()),
            UniformValue::Mat3(m) => join(m.to_cols_array()),
            UniformValue::Mat4(m) => join(m.to_cols_array()),
            UniformValue::Vec3Array(v) => join(v.iter().flat_map(|x| x.to_array())),
            UniformValue::Vec4Array(v) => join(v.iter().flat_map(|x| x.to_array())),
            UniformValue::Mat4Array(v) => join(v.iter().flat_map(|m| m.to_cols_array())),
            UniformValue::Texture(binding) => binding.name.clone(),
        }
    }
}

impl From<&Texture> for UniformValue {
    fn from(texture: &Texture) -> Self {
        UniformValue::Texture(TextureBinding {
            name: texture.name.clone(),
            handle: texture.handle,
        })
    }
}

impl From<bool> for UniformValue {
    fn from(value: bool) -> Self {
        UniformValue::Bool(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<Vec2> for UniformValue {
    fn from(value: Vec2) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        UniformValue::Mat4(value)
    }
}

impl From<&[Mat4]> for UniformValue {
    fn from(value: &[Mat4]) -> Self {
        UniformValue::Mat4Array(value.to_vec())
    }
}

impl From<&[Vec3]> for UniformValue {
    fn from(value: &[Vec3]) -> Self {
        UniformValue::Vec3Array(value.to_vec())
    }
}

/// Program cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterialKey {
    pub shader: String,
    pub macros: BTreeMap<String, String>,
}

impl MaterialKey {
    pub fn new(shader: &str, macros: &BTreeMap<String, String>) -> Self {
        Self {
            shader: shader.to_string(),
            macros: macros.clone(),
        }
    }
}

/// A linked program and its declared uniforms
#[derive(Debug, Clone)]
pub struct Material {
    pub key: MaterialKey,
    pub program: ProgramHandle,
    pub uniforms: Vec<UniformInfo>,
    /// Set when the last recompile failed; the previous program stays in use.
    pub failed: bool,
}

impl Material {
    pub fn compile(
        backend: &mut dyn GraphicsBackend,
        library: &ShaderLibrary,
        key: &MaterialKey,
    ) -> RenderResult<Self> {
        let desc = library.descriptor(&key.shader, &key.macros)?;
        let program = backend.create_program(&desc)?;
        let uniforms = backend.program_uniforms(program);
        log::debug!("Linked program {} with {} uniforms", key.shader, uniforms.len());
        Ok(Self {
            key: key.clone(),
            program,
            uniforms,
            failed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.key.shader
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformInfo> {
        self.uniforms.iter().find(|u| u.name == name)
    }
}

/// Uniform values bound to a compiled material
#[derive(Debug)]
pub struct MaterialInstance {
    name: String,
    key: MaterialKey,
    program: ProgramHandle,
    components: Vec<UniformInfo>,
    values: HashMap<String, UniformValue>,
    texture_units: HashMap<String, u32>,
    warned: Mutex<HashSet<String>>,
}

impl MaterialInstance {
    pub fn new(name: &str, material: &Material, textures: &TextureStore) -> Self {
        let mut instance = Self {
            name: name.to_string(),
            key: material.key.clone(),
            program: material.program,
            components: Vec::new(),
            values: HashMap::new(),
            texture_units: HashMap::new(),
            warned: Mutex::new(HashSet::new()),
        };
        instance.set_material(material, textures);
        instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader_name(&self) -> &str {
        &self.key.shader
    }

    pub fn key(&self) -> &MaterialKey {
        &self.key
    }

    pub fn macros(&self) -> &BTreeMap<String, String> {
        &self.key.macros
    }

    /// Drawn in the translucent pass instead of the solid passes.
    pub fn is_translucent(&self) -> bool {
        self.key
            .macros
            .get(TRANSPARENT_MATERIAL)
            .is_some_and(|value| value.trim() != "0")
    }

    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    /// Declared uniforms in declaration order.
    pub fn components(&self) -> &[UniformInfo] {
        &self.components
    }

    /// Stored values by uniform name.
    pub fn linked_material_component_map(&self) -> &HashMap<String, UniformValue> {
        &self.values
    }

    pub fn texture_unit(&self, name: &str) -> Option<u32> {
        self.texture_units.get(name).copied()
    }

    /// Reassign to another program. Values of uniforms the new program also
    /// declares are kept, the rest are dropped and new uniforms take their
    /// type defaults. Texture units follow the new declaration order.
    pub fn set_material(&mut self, material: &Material, textures: &TextureStore) {
        let mut values = HashMap::with_capacity(material.uniforms.len());
        let mut texture_units = HashMap::new();
        for info in &material.uniforms {
            if info.kind.is_sampler() {
                texture_units.insert(info.name.clone(), texture_units.len() as u32);
            }
            let kept = self
                .values
                .remove(&info.name)
                .filter(|value| value.matches(info.kind));
            let value =
                kept.unwrap_or_else(|| UniformValue::default_for(&info.name, info.kind, info.count, textures));
            values.insert(info.name.clone(), value);
        }
        self.key = material.key.clone();
        self.program = material.program;
        self.components = material.uniforms.clone();
        self.values = values;
        self.texture_units = texture_units;
        self.warned.lock().clear();
    }

    fn component(&self, name: &str) -> Option<&UniformInfo> {
        let found = self.components.iter().find(|u| u.name == name);
        if found.is_none() && self.warned.lock().insert(name.to_string()) {
            log::warn!("{}: unknown uniform {}", self.name, name);
        }
        found
    }

    pub fn get_uniform_data(&self, name: &str) -> Option<&UniformValue> {
        self.values.get(name)
    }

    /// Store a value. Unknown names warn once and are ignored; a value of
    /// the wrong type is an error.
    pub fn set_uniform_data(&mut self, name: &str, value: UniformValue) -> RenderResult<()> {
        let Some(info) = self.component(name) else {
            return Ok(());
        };
        if !value.matches(info.kind) {
            return Err(RenderError::UniformTypeMismatch {
                material: self.name.clone(),
                name: name.to_string(),
                expected: info.kind,
            });
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Store a texture by name; unknown texture names are recoverable.
    pub fn set_texture(&mut self, name: &str, texture_name: &str, textures: &TextureStore) -> RenderResult<()> {
        let texture = textures
            .by_name(texture_name)
            .ok_or_else(|| RenderError::MissingResource(format!("texture {}", texture_name)))?;
        let value = UniformValue::Texture(TextureBinding {
            name: texture.name.clone(),
            handle: texture.handle,
        });
        self.set_uniform_data(name, value)
    }

    /// Parse `text` for the declared type of `name` and store it.
    pub fn set_uniform_data_from_string(
        &mut self,
        name: &str,
        text: &str,
        textures: &TextureStore,
    ) -> RenderResult<()> {
        let Some(info) = self.component(name).cloned() else {
            return Ok(());
        };
        if info.kind.is_sampler() {
            return self.set_texture(name, text.trim(), textures);
        }
        let value = UniformValue::parse(info.kind, info.count, text).map_err(|message| {
            RenderError::InvalidAttribute {
                attribute: format!("{}.{}", self.name, name),
                message,
            }
        })?;
        self.set_uniform_data(name, value)
    }

    /// Upload every stored component to the current program.
    pub fn bind_material_instance(&self, backend: &mut dyn GraphicsBackend) -> RenderResult<()> {
        for info in &self.components {
            if let Some(value) = self.values.get(&info.name) {
                self.upload(backend, info, value)?;
            }
        }
        Ok(())
    }

    /// Shorthand for [`bind_uniform_data`](Self::bind_uniform_data) with a
    /// converted value.
    pub fn bind(
        &self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> RenderResult<()> {
        self.bind_uniform_data(backend, name, &value.into())
    }

    /// Upload one named uniform without storing it (per-draw data).
    pub fn bind_uniform_data(
        &self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        value: &UniformValue,
    ) -> RenderResult<()> {
        match self.component(name) {
            Some(info) => self.upload(backend, info, value),
            None => Ok(()),
        }
    }

    fn upload(&self, backend: &mut dyn GraphicsBackend, info: &UniformInfo, value: &UniformValue) -> RenderResult<()> {
        let data = match value {
            UniformValue::Absent => return Ok(()),
            UniformValue::Texture(binding) => {
                let unit = self.texture_units.get(&info.name).copied().ok_or_else(|| {
                    RenderError::UniformTypeMismatch {
                        material: self.name.clone(),
                        name: info.name.clone(),
                        expected: info.kind,
                    }
                })?;
                backend.bind_texture(unit, binding.handle);
                UniformData::TextureUnit(unit)
            }
            other => other.to_uniform_data().ok_or_else(|| RenderError::UniformTypeMismatch {
                material: self.name.clone(),
                name: info.name.clone(),
                expected: info.kind,
            })?,
        };
        if !data.matches(info.kind) {
            return Err(RenderError::UniformTypeMismatch {
                material: self.name.clone(),
                name: info.name.clone(),
                expected: info.kind,
            });
        }
        backend.set_uniform(info.location, &data)?;
        Ok(())
    }

    /// Material-instance file contents.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some("Shader")).set("shader", self.key.shader.as_str());
        // an empty section still marks the instance as macro-free
        ini.with_section(Some("Define"));
        for (name, value) in &self.key.macros {
            ini.with_section(Some("Define")).set(name.as_str(), value.as_str());
        }
        for info in &self.components {
            if let Some(value) = self.values.get(&info.name) {
                if *value != UniformValue::Absent {
                    ini.with_section(Some(info.kind.section_name()))
                        .set(info.name.as_str(), value.to_literal());
                }
            }
        }
        ini
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RenderResult<()> {
        let path = path.as_ref();
        self.to_ini().write_to_file(path)?;
        log::info!("Saved material instance {} to {}", self.name, path.display());
        Ok(())
    }

    /// Rebuild an instance from its file contents. The shader and macros
    /// pick the program; values are applied by declared type.
    pub fn from_ini(
        name: &str,
        ini: &Ini,
        backend: &mut dyn GraphicsBackend,
        materials: &mut MaterialStore,
        textures: &TextureStore,
    ) -> RenderResult<Self> {
        let shader = ini
            .section(Some("Shader"))
            .and_then(|s| s.get("shader"))
            .ok_or_else(|| RenderError::MaterialFile {
                path: name.to_string(),
                message: "missing [Shader] shader".into(),
            })?;
        let macros: BTreeMap<String, String> = ini
            .section(Some("Define"))
            .map(|s| s.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
            .unwrap_or_default();
        let material = materials.get_material(backend, shader, &macros)?;
        let mut instance = MaterialInstance::new(name, material, textures);
        for (section, properties) in ini.iter() {
            let Some(section) = section else { continue };
            if section == "Shader" || section == "Define" {
                continue;
            }
            if UniformKind::from_name(section).is_none() {
                log::warn!("{}: unknown section [{}]", name, section);
                continue;
            }
            for (key, value) in properties.iter() {
                crate::error::log_recoverable(
                    &format!("{}.{}", name, key),
                    instance.set_uniform_data_from_string(key, value, textures),
                )?;
            }
        }
        Ok(instance)
    }

    pub fn load(
        path: impl AsRef<Path>,
        backend: &mut dyn GraphicsBackend,
        materials: &mut MaterialStore,
        textures: &TextureStore,
    ) -> RenderResult<Self> {
        let path = path.as_ref();
        let ini = Ini::load_from_file(path).map_err(|e| RenderError::MaterialFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        Self::from_ini(&name, &ini, backend, materials, textures)
    }

    /// Copy under a new name.
    pub fn duplicate(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: self.key.clone(),
            program: self.program,
            components: self.components.clone(),
            values: self.values.clone(),
            texture_units: self.texture_units.clone(),
            warned: Mutex::new(HashSet::new()),
        }
    }
}

/// Program cache plus the arena of named material instances
pub struct MaterialStore {
    library: ShaderLibrary,
    materials: HashMap<MaterialKey, Material>,
    instances: SlotMap<MaterialInstanceId, MaterialInstance>,
    names: HashMap<String, MaterialInstanceId>,
}

impl MaterialStore {
    pub fn new(library: ShaderLibrary) -> Self {
        Self {
            library,
            materials: HashMap::new(),
            instances: SlotMap::with_key(),
            names: HashMap::new(),
        }
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    /// Linked program for `shader` with `macros`, compiled on first use.
    pub fn get_material(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        shader: &str,
        macros: &BTreeMap<String, String>,
    ) -> RenderResult<&Material> {
        let key = MaterialKey::new(shader, macros);
        if !self.materials.contains_key(&key) {
            let material = Material::compile(backend, &self.library, &key)?;
            self.materials.insert(key.clone(), material);
        }
        self.materials
            .get(&key)
            .ok_or_else(|| RenderError::MissingResource(format!("material {}", shader)))
    }

    pub fn material(&self, shader: &str, macros: &BTreeMap<String, String>) -> Option<&Material> {
        self.materials.get(&MaterialKey::new(shader, macros))
    }

    /// Program handle of `shader` without macros, compiled on first use.
    pub fn program(&mut self, backend: &mut dyn GraphicsBackend, shader: &str) -> RenderResult<ProgramHandle> {
        Ok(self.get_material(backend, shader, &BTreeMap::new())?.program)
    }

    /// Relink every cached program of `shader`. A failure keeps the old
    /// program and sets its failed flag; the next success clears it and
    /// moves instances over to the new program.
    pub fn recompile(&mut self, backend: &mut dyn GraphicsBackend, shader: &str) -> RenderResult<()> {
        let keys: Vec<MaterialKey> = self.materials.keys().filter(|k| k.shader == shader).cloned().collect();
        let mut first_error = None;
        for key in keys {
            match Material::compile(backend, &self.library, &key) {
                Ok(material) => {
                    if let Some(old) = self.materials.insert(key.clone(), material) {
                        backend.destroy_program(old.program);
                        if old.failed {
                            log::info!("Program {} recovered", shader);
                        }
                    }
                    if let Some(material) = self.materials.get(&key) {
                        for instance in self.instances.values_mut().filter(|i| i.key == key) {
                            // textures are looked up by handle so the store is not needed
                            instance.relink(material);
                        }
                    }
                }
                Err(error) => {
                    log::warn!("Recompiling {} failed: {}", shader, error);
                    if let Some(material) = self.materials.get_mut(&key) {
                        material.failed = true;
                    }
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Create an instance of `shader`; an existing instance of that name is replaced.
    pub fn create_instance(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        textures: &TextureStore,
        name: &str,
        shader: &str,
        macros: &BTreeMap<String, String>,
    ) -> RenderResult<MaterialInstanceId> {
        let material = self.get_material(backend, shader, macros)?;
        let instance = MaterialInstance::new(name, material, textures);
        Ok(self.insert(instance))
    }

    pub fn insert(&mut self, instance: MaterialInstance) -> MaterialInstanceId {
        if let Some(old) = self.names.remove(instance.name()) {
            self.instances.remove(old);
        }
        let name = instance.name().to_string();
        let id = self.instances.insert(instance);
        self.names.insert(name, id);
        id
    }

    /// Move an instance to another shader or macro set.
    pub fn set_material(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        textures: &TextureStore,
        id: MaterialInstanceId,
        shader: &str,
        macros: &BTreeMap<String, String>,
    ) -> RenderResult<()> {
        let key = MaterialKey::new(shader, macros);
        if !self.materials.contains_key(&key) {
            let material = Material::compile(backend, &self.library, &key)?;
            self.materials.insert(key.clone(), material);
        }
        let (Some(material), Some(instance)) = (self.materials.get(&key), self.instances.get_mut(id)) else {
            return Err(RenderError::MissingResource("material instance".into()));
        };
        instance.set_material(material, textures);
        Ok(())
    }

    /// Activate the instance's program and upload its stored components.
    pub fn use_instance(
        &self,
        backend: &mut dyn GraphicsBackend,
        id: MaterialInstanceId,
    ) -> RenderResult<&MaterialInstance> {
        let instance = self
            .instances
            .get(id)
            .ok_or_else(|| RenderError::MissingResource("material instance".into()))?;
        backend.use_program(instance.program());
        instance.bind_material_instance(backend)?;
        Ok(instance)
    }

    pub fn get(&self, id: MaterialInstanceId) -> Option<&MaterialInstance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: MaterialInstanceId) -> Option<&mut MaterialInstance> {
        self.instances.get_mut(id)
    }

    pub fn id_of(&self, name: &str) -> Option<MaterialInstanceId> {
        self.names.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&MaterialInstance> {
        self.id_of(name).and_then(|id| self.instances.get(id))
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.names
            .remove(name)
            .and_then(|id| self.instances.remove(id))
            .is_some()
    }

    pub fn instance_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn program_count(&self) -> usize {
        self.materials.len()
    }

    pub fn clear(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, material) in self.materials.drain() {
            backend.destroy_program(material.program);
        }
        self.instances.clear();
        self.names.clear();
    }
}

impl MaterialInstance {
    /// Point at a relinked program with the same uniform interface.
    fn relink(&mut self, material: &Material) {
        self.program = material.program;
        self.components = material.uniforms.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn setup() -> (DummyBackend, TextureStore, MaterialStore) {
        let mut backend = DummyBackend::new(64, 64);
        let mut textures = TextureStore::new();
        textures.create_default_textures(&mut backend).unwrap();
        (backend, textures, MaterialStore::new(ShaderLibrary::builtin()))
    }

    #[test]
    fn test_new_uniforms_take_type_defaults() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let instance = materials.get(id).unwrap();
        assert_eq!(instance.get_uniform_data("roughness"), Some(&UniformValue::Float(0.0)));
        assert_eq!(instance.get_uniform_data("albedo"), Some(&UniformValue::Vec4(Vec4::ONE)));
        assert_eq!(instance.get_uniform_data("model"), Some(&UniformValue::Mat4(Mat4::IDENTITY)));
        let diffuse = instance.get_uniform_data("texture_diffuse").unwrap();
        assert!(matches!(diffuse, UniformValue::Texture(t) if t.name == "common.flat_white"));
        let normal = instance.get_uniform_data("texture_normal").unwrap();
        assert!(matches!(normal, UniformValue::Texture(t) if t.name == FLAT_NORMAL));
        let probe = instance.get_uniform_data("texture_probe").unwrap();
        assert!(matches!(probe, UniformValue::Texture(t) if t.name == "default_cube"));
    }

    #[test]
    fn test_set_material_keeps_shared_values() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let rock = materials.get_mut(id).unwrap();
        rock.set_uniform_data("model", UniformValue::Mat4(Mat4::from_scale(Vec3::splat(2.0))))
            .unwrap();
        rock.set_uniform_data("roughness", UniformValue::Float(0.7)).unwrap();

        materials
            .set_material(&mut backend, &textures, id, "shadowmap", &BTreeMap::new())
            .unwrap();
        let rock = materials.get(id).unwrap();
        assert_eq!(
            rock.get_uniform_data("model"),
            Some(&UniformValue::Mat4(Mat4::from_scale(Vec3::splat(2.0))))
        );
        assert!(rock.get_uniform_data("roughness").is_none());
        assert_eq!(rock.linked_material_component_map().len(), rock.components().len());
    }

    #[test]
    fn test_type_mismatch_and_unknown_names() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let rock = materials.get_mut(id).unwrap();
        assert!(rock.set_uniform_data("no_such_uniform", UniformValue::Float(1.0)).is_ok());
        assert!(rock.get_uniform_data("no_such_uniform").is_none());
        let err = rock.set_uniform_data("roughness", UniformValue::Vec3(Vec3::ONE)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_set_uniform_data_from_string() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let rock = materials.get_mut(id).unwrap();
        rock.set_uniform_data_from_string("albedo", "[0.5, 0.25, 1, 1]", &textures).unwrap();
        rock.set_uniform_data_from_string("is_render_gbuffer", "true", &textures).unwrap();
        rock.set_uniform_data_from_string("texture_diffuse", "common.flat_black", &textures).unwrap();
        assert_eq!(
            rock.get_uniform_data("albedo"),
            Some(&UniformValue::Vec4(Vec4::new(0.5, 0.25, 1.0, 1.0)))
        );
        assert_eq!(rock.get_uniform_data("is_render_gbuffer"), Some(&UniformValue::Bool(true)));
        assert!(matches!(
            rock.get_uniform_data("texture_diffuse"),
            Some(UniformValue::Texture(t)) if t.name == "common.flat_black"
        ));
        let bad = rock.set_uniform_data_from_string("roughness", "rough", &textures);
        assert!(matches!(bad, Err(RenderError::InvalidAttribute { .. })));
    }

    #[test]
    fn test_ini_round_trip() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let rock = materials.get_mut(id).unwrap();
        rock.set_uniform_data("roughness", UniformValue::Float(0.3)).unwrap();
        rock.set_uniform_data("emissive", UniformValue::Vec3(Vec3::new(0.1, 2.0, 3.5)))
            .unwrap();
        rock.set_texture("texture_diffuse", "common.flat_black", &textures).unwrap();
        let ini = rock.to_ini();
        let original = rock.linked_material_component_map().clone();

        let loaded = MaterialInstance::from_ini("rock", &ini, &mut backend, &mut materials, &textures).unwrap();
        assert_eq!(loaded.linked_material_component_map(), &original);
        assert_eq!(loaded.shader_name(), "default");
    }

    #[test]
    fn test_bind_assigns_texture_units_in_declaration_order() {
        let (mut backend, textures, mut materials) = setup();
        let id = materials
            .create_instance(&mut backend, &textures, "rock", "default", &BTreeMap::new())
            .unwrap();
        let rock = materials.get(id).unwrap();
        assert_eq!(rock.texture_unit("texture_diffuse"), Some(0));
        assert_eq!(rock.texture_unit("texture_normal"), Some(1));
        backend.use_program(rock.program());
        rock.bind_material_instance(&mut backend).unwrap();
        rock.bind_uniform_data(&mut backend, "roughness", &UniformValue::Float(0.5))
            .unwrap();
    }

    #[test]
    fn test_programs_are_cached_per_macro_set() {
        let (mut backend, textures, mut materials) = setup();
        let mut macros = BTreeMap::new();
        materials
            .create_instance(&mut backend, &textures, "a", "default", &macros)
            .unwrap();
        materials
            .create_instance(&mut backend, &textures, "b", "default", &macros)
            .unwrap();
        assert_eq!(materials.program_count(), 1);
        macros.insert("USE_DETAIL".to_string(), "1".to_string());
        materials
            .create_instance(&mut backend, &textures, "c", "default", &macros)
            .unwrap();
        assert_eq!(materials.program_count(), 2);
        assert_eq!(materials.instance_names(), vec!["a", "b", "c"]);
    }
}
