use std::sync::LazyLock;

use crate::glib;

use ditector_gst_wgpu::{Effect, FrameTargets, WgpuContext, GST_CONTEXT_WGPU_TYPE};
use glib::object::Cast;
use glib::subclass::{object::ObjectImpl, types::ObjectSubclass};
use gst::prelude::*;
use gst::subclass::prelude::*;
use gst_base::prelude::BaseTransformExt;
use gst_base::subclass::prelude::*;
use gst_base::subclass::BaseTransformMode;
use gst_video::subclass::prelude::*;
use gst_video::prelude::VideoFrameExt;
use parking_lot::Mutex;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "ditector",
        gst::DebugColorFlags::empty(),
        Some("Ditector GPU colour inversion filter"),
    )
});

const PROP_ACTIVE: &str = "active";
const DEFAULT_ACTIVE: bool = false;

#[derive(Debug, Clone, Copy)]
struct Settings {
    active: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active: DEFAULT_ACTIVE,
        }
    }
}

/// Everything owned between start and stop
#[derive(Debug)]
struct State {
    context: WgpuContext,
    effect: Effect,
    targets: Option<FrameTargets>,
}

#[derive(Debug, Default)]
pub struct Ditector {
    settings: Mutex<Settings>,
    wgpu_context: Mutex<Option<WgpuContext>>,
    state: Mutex<Option<State>>,
}

impl Ditector {
    fn set_wgpu_context(&self, context: WgpuContext) {
        let mut lock = self.wgpu_context.lock();
        if lock.is_some() {
            return;
        }

        *lock = Some(context);
    }

    fn create_own_context(&self) -> Result<(), gst::ErrorMessage> {
        gst::info!(CAT, imp: self, "creating own wgpu context");

        let wgpu_ctx = WgpuContext::new_headless().map_err(|err| {
            gst::error_msg!(
                gst::ResourceError::OpenRead,
                ["Failed to create wgpu context: {}", err]
            )
        })?;

        let ctx = wgpu_ctx.as_gst_context();
        self.set_context(&ctx);

        let obj = self.obj();
        let message = gst::message::HaveContext::builder(ctx).src(&*obj).build();
        if let Err(err) = obj.upcast_ref::<gst::Element>().post_message(message) {
            gst::warning!(CAT, imp: self, "failed to announce wgpu context: {}", err);
        }

        Ok(())
    }

    fn acquire_context(&self) -> Result<WgpuContext, gst::ErrorMessage> {
        let obj = self.obj();
        let element = obj.upcast_ref::<gst::Element>();

        match WgpuContext::query_context_from_nearby_elements(element) {
            Ok(true) => gst::info!(CAT, imp: self, "using shared wgpu context"),
            Ok(false) => self.create_own_context()?,
            Err(err) => {
                gst::error!(CAT, imp: self, "failed to query wgpu context from nearby elements: {}", err);
                self.create_own_context()?;
            }
        }

        let shared = self.wgpu_context.lock().clone();
        if let Some(context) = shared {
            return Ok(context);
        }

        // A context of our type was found but could not be used
        self.create_own_context()?;
        self.wgpu_context.lock().clone().ok_or_else(|| {
            gst::error_msg!(
                gst::ResourceError::OpenRead,
                ["No wgpu context available"]
            )
        })
    }

    fn apply_settings(&self, settings: Settings) {
        gst::debug!(CAT, imp: self, "active: {}", settings.active);
        self.obj().set_passthrough(!settings.active);
    }
}

#[glib::object_subclass]
impl ObjectSubclass for Ditector {
    const NAME: &'static str = "GstDitector";
    type Type = super::Ditector;
    type ParentType = gst_video::VideoFilter;
}

impl ObjectImpl for Ditector {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            vec![glib::ParamSpecBoolean::builder(PROP_ACTIVE)
                .nick("Active")
                .blurb("True if the effect is active, false if not")
                .default_value(DEFAULT_ACTIVE)
                .mutable_playing()
                .build()]
        });

        PROPERTIES.as_ref()
    }

    fn constructed(&self) {
        self.parent_constructed();
        self.apply_settings(*self.settings.lock());
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        match pspec.name() {
            PROP_ACTIVE => {
                let settings = {
                    let mut settings = self.settings.lock();
                    settings.active = value.get().expect("type checked upstream");
                    *settings
                };
                self.apply_settings(settings);
            }
            _ => unimplemented!(),
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        match pspec.name() {
            PROP_ACTIVE => self.settings.lock().active.to_value(),
            _ => unimplemented!(),
        }
    }
}

impl GstObjectImpl for Ditector {}

impl ElementImpl for Ditector {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "Ditector",
                "Filter/Effect/Video",
                "Inverts the colours of the video frame on the GPU while active",
                "Iker Galardi",
            )
        });
        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Vec<gst::PadTemplate>> = LazyLock::new(|| {
            // The device limit is checked once targets are allocated
            let max = wgpu::Limits::default().max_texture_dimension_2d as i32;
            let caps = gst_video::VideoCapsBuilder::new()
                .format_list([gst_video::VideoFormat::Rgba, gst_video::VideoFormat::Rgbx])
                .width_range(1..=max)
                .height_range(1..=max)
                .build();

            vec![
                gst::PadTemplate::new(
                    "src",
                    gst::PadDirection::Src,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
                gst::PadTemplate::new(
                    "sink",
                    gst::PadDirection::Sink,
                    gst::PadPresence::Always,
                    &caps,
                )
                .unwrap(),
            ]
        });
        PAD_TEMPLATES.as_ref()
    }

    fn set_context(&self, context: &gst::Context) {
        if context.context_type() == GST_CONTEXT_WGPU_TYPE {
            gst::debug!(CAT, imp: self, "Received wgpu context");

            let Some(wgpu_ctx) = WgpuContext::map_gst_context_to_wgpu(context) else {
                gst::error!(CAT, imp: self, "Received invalid wgpu context");
                return;
            };

            self.set_wgpu_context(wgpu_ctx);
        }

        self.parent_set_context(context);
    }
}

impl BaseTransformImpl for Ditector {
    const MODE: BaseTransformMode = BaseTransformMode::AlwaysInPlace;
    const PASSTHROUGH_ON_SAME_CAPS: bool = false;
    const TRANSFORM_IP_ON_PASSTHROUGH: bool = false;

    fn start(&self) -> Result<(), gst::ErrorMessage> {
        let context = self.acquire_context()?;

        let effect = Effect::invert(&context).map_err(|err| {
            gst::error!(CAT, imp: self, "{}", err);
            gst::error_msg!(gst::LibraryError::Init, ["{}", err])
        })?;

        *self.state.lock() = Some(State {
            context,
            effect,
            targets: None,
        });

        self.apply_settings(*self.settings.lock());
        gst::info!(CAT, imp: self, "started");

        Ok(())
    }

    fn stop(&self) -> Result<(), gst::ErrorMessage> {
        // Effect and targets are released with the state
        *self.state.lock() = None;
        gst::info!(CAT, imp: self, "stopped");

        Ok(())
    }
}

impl VideoFilterImpl for Ditector {
    fn set_info(
        &self,
        incaps: &gst::Caps,
        in_info: &gst_video::VideoInfo,
        outcaps: &gst::Caps,
        out_info: &gst_video::VideoInfo,
    ) -> Result<(), gst::LoggableError> {
        let mut state = self.state.lock();
        let Some(state) = state.as_mut() else {
            return Err(gst::loggable_error!(CAT, "set_info called before start"));
        };

        gst::info!(CAT, imp: self, "negotiated caps {:?} -> {:?}", incaps, outcaps);

        state.targets = None;
        let targets = state
            .effect
            .targets(&state.context, in_info.width(), in_info.height())
            .map_err(|err| gst::loggable_error!(CAT, "cannot allocate targets: {}", err))?;
        state.targets = Some(targets);

        self.parent_set_info(incaps, in_info, outcaps, out_info)
    }

    fn transform_frame_ip(
        &self,
        frame: &mut gst_video::VideoFrameRef<&mut gst::BufferRef>,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        if !self.settings.lock().active {
            return Ok(gst::FlowSuccess::Ok);
        }

        let state = self.state.lock();
        let Some(State {
            context,
            effect,
            targets: Some(targets),
        }) = &*state
        else {
            return Err(gst::FlowError::NotNegotiated);
        };

        let stride = frame.plane_stride()[0] as usize;
        let plane = frame.plane_data_mut(0).map_err(|err| {
            gst::error!(CAT, imp: self, "cannot access frame data: {}", err);
            gst::FlowError::Error
        })?;

        let readback = effect.apply(context, targets, plane, stride).map_err(|err| {
            gst::error!(CAT, imp: self, "error while rendering the effect: {}", err);
            gst::FlowError::Error
        })?;

        readback.copy_to(plane, stride).map_err(|err| {
            gst::error!(CAT, imp: self, "error while reading back the frame: {}", err);
            gst::FlowError::Error
        })?;

        Ok(gst::FlowSuccess::Ok)
    }
}
