//! UI command protocol
//!
//! Commands travel as newline-delimited JSON objects of the form
//! `{"command": "SET_ANTIALIASING", "value": 2}`. Each line is parsed once
//! into a [`CommandRecord`] with a typed [`CommandPayload`] and pushed
//! through a bounded queue that the frame loop drains before updating the
//! scene. Replies use the same wire form.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{RenderError, RenderResult};
use crate::ocean::OceanAttribute;

/// Every command id of the UI protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    UiRun,
    UiRunOk,
    ShowUi,
    HideUi,
    Fail,
    CloseApp,
    CloseUi,
    Reload,
    RequestPipe,
    PipeDone,
    SortUiItems,

    NewProject,
    OpenProject,
    SaveProject,
    NewScene,
    SaveScene,
    Play,
    Stop,

    ViewmodeWireframe,
    ViewmodeShading,

    TransScreenInfo,
    ChangeResolution,

    LoadResource,
    ActionResource,
    DuplicateResource,
    SaveResource,
    DeleteResource,
    DeleteResourceInfo,
    RequestResourceList,
    TransResourceList,
    TransResourceInfo,
    RequestResourceAttribute,
    TransResourceAttribute,
    SetResourceAttribute,
    AddResourceComponent,
    DeleteResourceComponent,

    AddCamera,
    AddLight,
    CreateParticle,
    CreateCollision,
    CreateSpline,

    ClearObjectList,
    RequestObjectList,
    TransObjectList,
    ActionObject,
    DeleteObject,
    DeleteObjectInfo,
    TransObjectInfo,
    RequestObjectAttribute,
    TransObjectAttribute,
    SetObjectAttribute,
    SetObjectSelect,
    SetObjectFocus,
    AddObjectComponent,
    DeleteObjectComponent,

    ClearRendertargetList,
    TransRendertargetInfo,
    ViewRendertarget,
    RecreateRenderTargets,
    ViewTexture,
    ViewMaterialInstance,

    TransAntialiasingList,
    SetAntialiasing,
    TransRenderingTypeList,
    SetRenderingType,

    TransGameBackendIndex,
    TransGameBackendList,
    ChangeGameBackend,
}

/// A resource or scene object addressed by name and type name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub name: String,
    pub type_name: String,
}

/// One attribute edit from the attribute panel
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEdit {
    pub target: ObjectKey,
    pub attribute: String,
    pub value: Value,
    /// Enclosing component for nested attributes
    pub parent_info: Value,
    pub index: i32,
}

/// Payload of a command, shaped by its id
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    None,
    Name(String),
    Index(i32),
    Resolution {
        width: u32,
        height: u32,
        fullscreen: bool,
    },
    Object(ObjectKey),
    SetAttribute(AttributeEdit),
    Component {
        target: ObjectKey,
        attribute: String,
        parent_info: Value,
        index: i32,
    },
    RenderTarget {
        index: i32,
        name: String,
    },
    /// Replies carry free-form data
    Data(Value),
}

/// Wire form of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    #[serde(default)]
    pub value: Value,
}

/// A parsed command as carried by the queue
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub command: Command,
    pub payload: CommandPayload,
}

fn malformed(command: Command, error: impl std::fmt::Display) -> RenderError {
    RenderError::Command(format!("{:?}: {}", command, error))
}

fn from_value<T: serde::de::DeserializeOwned>(command: Command, value: Value) -> RenderResult<T> {
    serde_json::from_value(value).map_err(|e| malformed(command, e))
}

fn object_key(command: Command, value: Value) -> RenderResult<ObjectKey> {
    let (name, type_name): (String, String) = from_value(command, value)?;
    Ok(ObjectKey { name, type_name })
}

impl CommandRecord {
    pub fn new(command: Command, payload: CommandPayload) -> Self {
        Self { command, payload }
    }

    /// Command without a payload
    pub fn bare(command: Command) -> Self {
        Self::new(command, CommandPayload::None)
    }

    /// Reply carrying arbitrary data
    pub fn data(command: Command, value: Value) -> Self {
        Self::new(command, CommandPayload::Data(value))
    }

    /// Parse one line of the wire protocol.
    pub fn parse(line: &str) -> RenderResult<Self> {
        let message: Message = serde_json::from_str(line)?;
        Self::from_message(message)
    }

    /// Check the value against the shape the command expects.
    pub fn from_message(message: Message) -> RenderResult<Self> {
        use Command::*;
        let Message { command, value } = message;
        let payload = match command {
            NewProject | OpenProject | ActionObject | DeleteObject | DeleteObjectInfo | SetObjectSelect
            | SetObjectFocus | ViewTexture | ViewMaterialInstance => {
                CommandPayload::Name(from_value(command, value)?)
            }
            SetAntialiasing | SetRenderingType | ChangeGameBackend | TransGameBackendIndex => {
                CommandPayload::Index(from_value(command, value)?)
            }
            ChangeResolution | TransScreenInfo => {
                let (width, height, fullscreen): (u32, u32, bool) = from_value(command, value)?;
                CommandPayload::Resolution {
                    width,
                    height,
                    fullscreen,
                }
            }
            LoadResource | ActionResource | DuplicateResource | SaveResource | DeleteResource
            | RequestResourceAttribute | RequestObjectAttribute => CommandPayload::Object(object_key(command, value)?),
            SetResourceAttribute | SetObjectAttribute => {
                let (name, type_name, attribute, value, parent_info, index): (String, String, String, Value, Value, i32) =
                    from_value(command, value)?;
                CommandPayload::SetAttribute(AttributeEdit {
                    target: ObjectKey { name, type_name },
                    attribute,
                    value,
                    parent_info,
                    index,
                })
            }
            AddResourceComponent | DeleteResourceComponent | AddObjectComponent | DeleteObjectComponent => {
                let (name, type_name, attribute, parent_info, index): (String, String, String, Value, i32) =
                    from_value(command, value)?;
                CommandPayload::Component {
                    target: ObjectKey { name, type_name },
                    attribute,
                    parent_info,
                    index,
                }
            }
            ViewRendertarget => {
                let (index, name): (i32, String) = from_value(command, value)?;
                CommandPayload::RenderTarget { index, name }
            }
            DeleteResourceInfo | TransResourceList | TransResourceInfo | TransResourceAttribute | TransObjectList
            | TransObjectInfo | TransObjectAttribute | TransRendertargetInfo | TransAntialiasingList
            | TransRenderingTypeList | TransGameBackendList => CommandPayload::Data(value),
            _ => CommandPayload::None,
        };
        Ok(Self { command, payload })
    }

    /// Back to the wire form.
    pub fn to_message(&self) -> Message {
        let value = match &self.payload {
            CommandPayload::None => Value::Null,
            CommandPayload::Name(name) => json!(name),
            CommandPayload::Index(index) => json!(index),
            CommandPayload::Resolution {
                width,
                height,
                fullscreen,
            } => json!([width, height, fullscreen]),
            CommandPayload::Object(key) => json!([key.name, key.type_name]),
            CommandPayload::SetAttribute(edit) => json!([
                edit.target.name,
                edit.target.type_name,
                edit.attribute,
                edit.value,
                edit.parent_info,
                edit.index
            ]),
            CommandPayload::Component {
                target,
                attribute,
                parent_info,
                index,
            } => json!([target.name, target.type_name, attribute, parent_info, index]),
            CommandPayload::RenderTarget { index, name } => json!([index, name]),
            CommandPayload::Data(value) => value.clone(),
        };
        Message {
            command: self.command,
            value,
        }
    }

    /// One line of the wire protocol, without the newline.
    pub fn to_line(&self) -> RenderResult<String> {
        Ok(serde_json::to_string(&self.to_message())?)
    }
}

/// Producer half of a command queue. Not cloneable: each queue has one
/// producer thread.
pub struct CommandSender {
    sender: Sender<CommandRecord>,
}

/// Consumer half of a command queue
pub struct CommandReceiver {
    receiver: Receiver<CommandRecord>,
}

/// Bounded single-producer single-consumer queue of command records.
pub fn command_queue(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
    (CommandSender { sender }, CommandReceiver { receiver })
}

impl CommandSender {
    /// Block until there is room. Fails once the receiver is gone.
    pub fn send(&self, record: CommandRecord) -> RenderResult<()> {
        self.sender
            .send(record)
            .map_err(|e| RenderError::Command(format!("queue closed, dropped {:?}", e.0.command)))
    }

    /// Queue without blocking; a full queue drops the record and returns
    /// false.
    pub fn try_send(&self, record: CommandRecord) -> RenderResult<bool> {
        match self.sender.try_send(record) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(record)) => {
                log::warn!("Command queue full, dropping {:?}", record.command);
                Ok(false)
            }
            Err(TrySendError::Disconnected(record)) => Err(RenderError::Command(format!(
                "queue closed, dropped {:?}",
                record.command
            ))),
        }
    }
}

impl CommandReceiver {
    /// Everything queued so far, without blocking.
    pub fn drain(&self) -> impl Iterator<Item = CommandRecord> + '_ {
        self.receiver.try_iter()
    }

    /// Block until the next record; `None` once every sender is gone.
    pub fn recv(&self) -> Option<CommandRecord> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<CommandRecord> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Attribute values arrive as JSON numbers, booleans, arrays or strings;
/// the parsers below work on the text form.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn invalid(attribute: &str, message: impl Into<String>) -> RenderError {
    RenderError::InvalidAttribute {
        attribute: attribute.to_string(),
        message: message.into(),
    }
}

fn parse_bool(attribute: &str, text: &str) -> RenderResult<bool> {
    match text.trim() {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(invalid(attribute, format!("'{}' is not a boolean", other))),
    }
}

fn parse_numbers(attribute: &str, text: &str) -> RenderResult<Vec<f32>> {
    text.split(|c: char| c == ',' || c.is_whitespace() || "[]()".contains(c))
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|_| invalid(attribute, format!("'{}' is not a number", s)))
        })
        .collect()
}

fn parse_f32(attribute: &str, text: &str) -> RenderResult<f32> {
    match parse_numbers(attribute, text)?.as_slice() {
        [v] => Ok(*v),
        _ => Err(invalid(attribute, format!("'{}' is not a number", text))),
    }
}

fn parse_vec3(attribute: &str, text: &str) -> RenderResult<Vec3> {
    match parse_numbers(attribute, text)?.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        other => Err(invalid(attribute, format!("expected 3 components, got {}", other.len()))),
    }
}

/// Three components are accepted with an alpha of 1.
fn parse_color(attribute: &str, text: &str) -> RenderResult<Vec4> {
    match parse_numbers(attribute, text)?.as_slice() {
        [r, g, b] => Ok(Vec4::new(*r, *g, *b, 1.0)),
        [r, g, b, a] => Ok(Vec4::new(*r, *g, *b, *a)),
        other => Err(invalid(attribute, format!("expected 3 or 4 components, got {}", other.len()))),
    }
}

/// Scene object types addressable by the attribute panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Camera,
    MainLight,
    PointLight,
    Actor,
    LightProbe,
    Atmosphere,
    Ocean,
    Effect,
    /// Renderer and post-process switches
    RenderOption,
}

impl ObjectKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Camera" => ObjectKind::Camera,
            "MainLight" | "DirectionalLight" => ObjectKind::MainLight,
            "PointLight" => ObjectKind::PointLight,
            "Actor" | "StaticActor" | "SkeletonActor" => ObjectKind::Actor,
            "LightProbe" => ObjectKind::LightProbe,
            "Atmosphere" => ObjectKind::Atmosphere,
            "Ocean" => ObjectKind::Ocean,
            "Effect" => ObjectKind::Effect,
            "RenderOption" | "PostProcess" => ObjectKind::RenderOption,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Camera => "Camera",
            ObjectKind::MainLight => "MainLight",
            ObjectKind::PointLight => "PointLight",
            ObjectKind::Actor => "Actor",
            ObjectKind::LightProbe => "LightProbe",
            ObjectKind::Atmosphere => "Atmosphere",
            ObjectKind::Ocean => "Ocean",
            ObjectKind::Effect => "Effect",
            ObjectKind::RenderOption => "RenderOption",
        }
    }
}

/// Renderer switches exposed as attributes of the `RenderOption` object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOptionAttribute {
    RenderShadow(bool),
    RenderSkeletal(bool),
    RenderEffects(bool),
    RenderFont(bool),
    RenderBloom(bool),
    RenderMotionBlur(bool),
    RenderSsao(bool),
    RenderSsr(bool),
    RenderTonemapping(bool),
    BloomIntensity(f32),
    MotionBlurScale(f32),
    Exposure(f32),
    Contrast(f32),
    DebugTextureLod(f32),
}

impl RenderOptionAttribute {
    pub fn name(&self) -> &'static str {
        use RenderOptionAttribute::*;
        match self {
            RenderShadow(_) => "is_render_shadow",
            RenderSkeletal(_) => "is_render_skeletal",
            RenderEffects(_) => "is_render_effects",
            RenderFont(_) => "is_render_font",
            RenderBloom(_) => "is_render_bloom",
            RenderMotionBlur(_) => "is_render_motion_blur",
            RenderSsao(_) => "is_render_ssao",
            RenderSsr(_) => "is_render_ssr",
            RenderTonemapping(_) => "is_render_tonemapping",
            BloomIntensity(_) => "bloom_intensity",
            MotionBlurScale(_) => "motion_blur_scale",
            Exposure(_) => "exposure",
            Contrast(_) => "contrast",
            DebugTextureLod(_) => "debug_texture_lod",
        }
    }

    pub fn parse(name: &str, text: &str) -> RenderResult<Self> {
        use RenderOptionAttribute::*;
        let flag = || parse_bool(name, text);
        let number = || parse_f32(name, text);
        Ok(match name {
            "is_render_shadow" => RenderShadow(flag()?),
            "is_render_skeletal" => RenderSkeletal(flag()?),
            "is_render_effects" => RenderEffects(flag()?),
            "is_render_font" => RenderFont(flag()?),
            "is_render_bloom" => RenderBloom(flag()?),
            "is_render_motion_blur" => RenderMotionBlur(flag()?),
            "is_render_ssao" => RenderSsao(flag()?),
            "is_render_ssr" => RenderSsr(flag()?),
            "is_render_tonemapping" => RenderTonemapping(flag()?),
            "bloom_intensity" => BloomIntensity(number()?),
            "motion_blur_scale" => MotionBlurScale(number()?),
            "exposure" => Exposure(number()?),
            "contrast" => Contrast(number()?),
            "debug_texture_lod" => DebugTextureLod(number()?),
            _ => return Err(invalid(name, "unknown render option")),
        })
    }

    pub fn value(&self) -> Value {
        use RenderOptionAttribute::*;
        match *self {
            RenderShadow(v) | RenderSkeletal(v) | RenderEffects(v) | RenderFont(v) | RenderBloom(v)
            | RenderMotionBlur(v) | RenderSsao(v) | RenderSsr(v) | RenderTonemapping(v) => json!(v),
            BloomIntensity(v) | MotionBlurScale(v) | Exposure(v) | Contrast(v) | DebugTextureLod(v) => json!(v),
        }
    }
}

/// Statically typed attribute of a scene object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObjectAttribute {
    Position(Vec3),
    Rotation(Vec3),
    Scale(Vec3),
    Visible(bool),
    CastShadow(bool),
    Fov(f32),
    Near(f32),
    Far(f32),
    LightColor(Vec4),
    LightRadius(f32),
    ShadowExp(f32),
    ShadowBias(f32),
    ShadowSamples(i32),
    RenderAtmosphere(bool),
    Ocean(OceanAttribute),
    RenderOption(RenderOptionAttribute),
}

impl ObjectAttribute {
    pub fn name(&self) -> &'static str {
        use ObjectAttribute::*;
        match self {
            Position(_) => "position",
            Rotation(_) => "rotation",
            Scale(_) => "scale",
            Visible(_) => "visible",
            CastShadow(_) => "cast_shadow",
            Fov(_) => "fov",
            Near(_) => "near",
            Far(_) => "far",
            LightColor(_) => "light_color",
            LightRadius(_) => "light_radius",
            ShadowExp(_) => "shadow_exp",
            ShadowBias(_) => "shadow_bias",
            ShadowSamples(_) => "shadow_samples",
            RenderAtmosphere(_) => "is_render_atmosphere",
            Ocean(attribute) => attribute.name(),
            RenderOption(attribute) => attribute.name(),
        }
    }

    /// Parse `name` for an object of `kind`.
    pub fn parse(kind: ObjectKind, name: &str, value: &Value) -> RenderResult<Self> {
        use ObjectAttribute::*;
        let text = value_text(value);
        match kind {
            ObjectKind::Ocean => return Ok(Ocean(OceanAttribute::parse(name, &text)?)),
            ObjectKind::RenderOption => return Ok(RenderOption(RenderOptionAttribute::parse(name, &text)?)),
            _ => {}
        }
        let attribute = match name {
            "position" => Position(parse_vec3(name, &text)?),
            "rotation" => Rotation(parse_vec3(name, &text)?),
            "scale" => Scale(parse_vec3(name, &text)?),
            "visible" => Visible(parse_bool(name, &text)?),
            "cast_shadow" => CastShadow(parse_bool(name, &text)?),
            "fov" => Fov(parse_f32(name, &text)?),
            "near" => Near(parse_f32(name, &text)?),
            "far" => Far(parse_f32(name, &text)?),
            "light_color" => LightColor(parse_color(name, &text)?),
            "light_radius" => LightRadius(parse_f32(name, &text)?),
            "shadow_exp" => ShadowExp(parse_f32(name, &text)?),
            "shadow_bias" => ShadowBias(parse_f32(name, &text)?),
            "shadow_samples" => ShadowSamples(parse_f32(name, &text)? as i32),
            "is_render_atmosphere" => RenderAtmosphere(parse_bool(name, &text)?),
            _ => return Err(invalid(name, format!("unknown {} attribute", kind.name()))),
        };
        if attribute.applies_to(kind) {
            Ok(attribute)
        } else {
            Err(invalid(name, format!("not an attribute of {}", kind.name())))
        }
    }

    /// Whether an object of `kind` carries this attribute.
    pub fn applies_to(&self, kind: ObjectKind) -> bool {
        use ObjectAttribute::*;
        match self {
            Position(_) | Rotation(_) => !matches!(
                kind,
                ObjectKind::Atmosphere | ObjectKind::Ocean | ObjectKind::RenderOption
            ),
            Scale(_) => matches!(kind, ObjectKind::Actor | ObjectKind::Effect | ObjectKind::LightProbe),
            Visible(_) | CastShadow(_) => kind == ObjectKind::Actor,
            Fov(_) | Near(_) | Far(_) => kind == ObjectKind::Camera,
            LightColor(_) => matches!(kind, ObjectKind::MainLight | ObjectKind::PointLight),
            LightRadius(_) => kind == ObjectKind::PointLight,
            ShadowExp(_) | ShadowBias(_) | ShadowSamples(_) => kind == ObjectKind::MainLight,
            RenderAtmosphere(_) => kind == ObjectKind::Atmosphere,
            Ocean(_) => kind == ObjectKind::Ocean,
            RenderOption(_) => kind == ObjectKind::RenderOption,
        }
    }

    /// Value in the form replies use.
    pub fn value(&self) -> Value {
        use ObjectAttribute::*;
        match *self {
            Position(v) | Rotation(v) | Scale(v) => json!(v.to_array()),
            Visible(v) | CastShadow(v) | RenderAtmosphere(v) => json!(v),
            Fov(v) | Near(v) | Far(v) | LightRadius(v) | ShadowExp(v) | ShadowBias(v) => json!(v),
            LightColor(v) => json!(v.to_array()),
            ShadowSamples(v) => json!(v),
            Ocean(attribute) => match attribute {
                OceanAttribute::IsRenderOcean(v) => json!(v),
                OceanAttribute::Height(v)
                | OceanAttribute::Wind(v)
                | OceanAttribute::Omega(v)
                | OceanAttribute::Amplitude(v)
                | OceanAttribute::SimulationWind(v)
                | OceanAttribute::SimulationAmplitude(v)
                | OceanAttribute::SimulationScale(v) => json!(v),
            },
            RenderOption(attribute) => attribute.value(),
        }
    }
}

/// Statically typed attribute of a material instance
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceAttribute {
    /// Literal for a declared uniform; sampler uniforms take a texture name
    Uniform { name: String, value: String },
    /// Move the instance to another shader
    Shader(String),
    /// Set a preprocessor define; `None` removes it
    Macro { name: String, value: Option<String> },
}

impl ResourceAttribute {
    /// `shader` and `macro.<NAME>` are reserved; anything else names a
    /// uniform.
    pub fn parse(name: &str, value: &Value) -> RenderResult<Self> {
        let text = value_text(value);
        if name == "shader" {
            if text.trim().is_empty() {
                return Err(invalid(name, "empty shader name"));
            }
            return Ok(ResourceAttribute::Shader(text.trim().to_string()));
        }
        if let Some(define) = name.strip_prefix("macro.") {
            let value = (!value.is_null()).then(|| text.trim().to_string());
            return Ok(ResourceAttribute::Macro {
                name: define.to_string(),
                value,
            });
        }
        Ok(ResourceAttribute::Uniform {
            name: name.to_string(),
            value: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_command_ids_use_protocol_names() {
        let line = CommandRecord::bare(Command::UiRunOk).to_line().unwrap();
        assert_eq!(line, r#"{"command":"UI_RUN_OK","value":null}"#);
        let record = CommandRecord::parse(r#"{"command":"VIEWMODE_WIREFRAME"}"#).unwrap();
        assert_eq!(record, CommandRecord::bare(Command::ViewmodeWireframe));
        let record = CommandRecord::parse(r#"{"command":"CLEAR_RENDERTARGET_LIST"}"#).unwrap();
        assert_eq!(record.command, Command::ClearRendertargetList);
    }

    #[test]
    fn test_payloads_are_typed_at_the_boundary() {
        let record = CommandRecord::parse(r#"{"command":"CHANGE_RESOLUTION","value":[640,480,false]}"#).unwrap();
        assert_eq!(
            record.payload,
            CommandPayload::Resolution {
                width: 640,
                height: 480,
                fullscreen: false
            }
        );
        let record = CommandRecord::parse(r#"{"command":"VIEW_RENDERTARGET","value":[3,"HDR"]}"#).unwrap();
        assert_eq!(
            record.payload,
            CommandPayload::RenderTarget {
                index: 3,
                name: "HDR".into()
            }
        );
        let record = CommandRecord::parse(
            r#"{"command":"SET_OBJECT_ATTRIBUTE","value":["ocean","Ocean","wind",7.5,null,0]}"#,
        )
        .unwrap();
        let CommandPayload::SetAttribute(edit) = record.payload else {
            panic!("expected an attribute edit");
        };
        assert_eq!(edit.target.type_name, "Ocean");
        assert_eq!(edit.value, json!(7.5));
    }

    #[test]
    fn test_malformed_payload_is_external() {
        let err = CommandRecord::parse(r#"{"command":"SET_ANTIALIASING","value":"taa"}"#).unwrap_err();
        assert!(matches!(err, RenderError::Command(_)));
        assert_eq!(err.kind(), ErrorKind::External);
        let err = CommandRecord::parse(r#"{"command":"NOT_A_COMMAND"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::External);
    }

    #[test]
    fn test_wire_form_survives_the_queue() {
        let (sender, receiver) = command_queue(4);
        let record = CommandRecord::new(
            Command::SetResourceAttribute,
            CommandPayload::SetAttribute(AttributeEdit {
                target: ObjectKey {
                    name: "default".into(),
                    type_name: "MaterialInstance".into(),
                },
                attribute: "roughness".into(),
                value: json!("0.25"),
                parent_info: Value::Null,
                index: 0,
            }),
        );
        sender.send(record.clone()).unwrap();
        let received: Vec<_> = receiver.drain().collect();
        assert_eq!(received, vec![record.clone()]);
        let reparsed = CommandRecord::parse(&record.to_line().unwrap()).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (sender, receiver) = command_queue(2);
        assert!(sender.try_send(CommandRecord::bare(Command::Play)).unwrap());
        assert!(sender.try_send(CommandRecord::bare(Command::Stop)).unwrap());
        assert!(!sender.try_send(CommandRecord::bare(Command::CloseApp)).unwrap());
        assert_eq!(receiver.len(), 2);
        drop(receiver);
        assert!(sender.send(CommandRecord::bare(Command::Play)).is_err());
    }

    #[test]
    fn test_object_attributes_check_their_object() {
        let position = ObjectAttribute::parse(ObjectKind::Actor, "position", &json!([1, 2, 3])).unwrap();
        assert_eq!(position, ObjectAttribute::Position(Vec3::new(1.0, 2.0, 3.0)));
        let color = ObjectAttribute::parse(ObjectKind::MainLight, "light_color", &json!("1 0.5 0")).unwrap();
        assert_eq!(color, ObjectAttribute::LightColor(Vec4::new(1.0, 0.5, 0.0, 1.0)));
        assert!(ObjectAttribute::parse(ObjectKind::Camera, "cast_shadow", &json!(true)).is_err());
        let wind = ObjectAttribute::parse(ObjectKind::Ocean, "wind", &json!(7.5)).unwrap();
        assert_eq!(wind, ObjectAttribute::Ocean(OceanAttribute::Wind(7.5)));
        assert_eq!(wind.value(), json!(7.5));
        let err = ObjectAttribute::parse(ObjectKind::Camera, "fov", &json!("wide")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Recoverable);
    }

    #[test]
    fn test_resource_attribute_names() {
        assert_eq!(
            ResourceAttribute::parse("shader", &json!("default")).unwrap(),
            ResourceAttribute::Shader("default".into())
        );
        assert_eq!(
            ResourceAttribute::parse("macro.TRANSPARENT_MATERIAL", &json!(1)).unwrap(),
            ResourceAttribute::Macro {
                name: "TRANSPARENT_MATERIAL".into(),
                value: Some("1".into())
            }
        );
        assert_eq!(
            ResourceAttribute::parse("albedo", &json!([1, 0, 0, 1])).unwrap(),
            ResourceAttribute::Uniform {
                name: "albedo".into(),
                value: "1,0,0,1".into()
            }
        );
    }
}
