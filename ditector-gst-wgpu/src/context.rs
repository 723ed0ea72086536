//!
//! Sharing one wgpu device between elements through GstContext
//!

use std::sync::LazyLock;

use gst::{prelude::*, subclass::prelude::*};

use crate::glib;

/// GstContext type string used to match the context on look up
pub const GST_CONTEXT_WGPU_TYPE: &str = "rust.wgpu.Context";

const GST_CONTEXT_WGPU_FIELD: &str = "context";

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "ditectorwgpucontext",
        gst::DebugColorFlags::empty(),
        Some("Ditector WGPU Context"),
    )
});

glib::wrapper! {
    /// A wgpu device and queue which can travel through the pipeline as a GstContext.
    ///
    /// The device is never polled in the background, users wait on their own submissions.
    pub struct WgpuContext(ObjectSubclass<imp::WgpuContext>);
}

impl WgpuContext {
    /// Wraps self into a persistent GstContext
    pub fn as_gst_context(&self) -> gst::Context {
        let mut ctx = gst::Context::new(GST_CONTEXT_WGPU_TYPE, true);
        if let Some(ctx_mut) = ctx.get_mut() {
            ctx_mut
                .structure_mut()
                .set(GST_CONTEXT_WGPU_FIELD, self.clone());
        }

        ctx
    }

    /// Creates a context on the adapter matching `adapter_options` using the device description `desc`
    pub fn new(
        adapter_options: &wgpu::RequestAdapterOptions<'_, '_>,
        desc: &wgpu::DeviceDescriptor<'_>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = Self::request_adapter(&instance, adapter_options)?;
        let (device, queue) = Self::request_device(&adapter, desc)?;

        Ok(Self::from_inner(imp::Inner {
            instance,
            adapter,
            device,
            queue,
        }))
    }

    /// Creates a context which requests every stable feature and the full limits of the adapter
    pub fn new_with_all_limits(
        adapter_options: &wgpu::RequestAdapterOptions<'_, '_>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = Self::request_adapter(&instance, adapter_options)?;

        let mut features = adapter.features();
        features.set(wgpu::Features::all_experimental_mask(), false);

        let desc = wgpu::DeviceDescriptor {
            label: Some("ditector-wgpu-device"),
            memory_hints: wgpu::MemoryHints::Performance,
            required_features: features,
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            trace: wgpu::Trace::Off,
        };
        let (device, queue) = Self::request_device(&adapter, &desc)?;

        Ok(Self::from_inner(imp::Inner {
            instance,
            adapter,
            device,
            queue,
        }))
    }

    /// Creates a context on the default adapter without a surface
    pub fn new_headless() -> Result<Self, Box<dyn std::error::Error>> {
        Self::new_with_all_limits(&wgpu::RequestAdapterOptions {
            compatible_surface: None,
            ..Default::default()
        })
    }

    fn request_adapter(
        instance: &wgpu::Instance,
        options: &wgpu::RequestAdapterOptions<'_, '_>,
    ) -> Result<wgpu::Adapter, Box<dyn std::error::Error>> {
        pollster::block_on(instance.request_adapter(options)).map_err(|err| {
            gst::error!(CAT, "Failed to request adapter: {}", err);
            Box::new(err) as Box<dyn std::error::Error>
        })
    }

    fn request_device(
        adapter: &wgpu::Adapter,
        desc: &wgpu::DeviceDescriptor<'_>,
    ) -> Result<(wgpu::Device, wgpu::Queue), Box<dyn std::error::Error>> {
        pollster::block_on(adapter.request_device(desc)).map_err(|err| {
            gst::error!(CAT, "Failed to request device: {}", err);
            Box::new(err) as Box<dyn std::error::Error>
        })
    }

    fn from_inner(inner: imp::Inner) -> Self {
        let out: Self = glib::Object::new();
        gst::info!(CAT, obj: out, "created on adapter {:?}", inner.adapter.get_info().name);

        if out.imp().inner.set(inner).is_err() {
            unreachable!("freshly constructed context already initialised");
        }

        out
    }

    fn inner(&self) -> &imp::Inner {
        // Every public constructor goes through from_inner
        self.imp()
            .inner
            .get()
            .expect("WgpuContext must be created with one of its associated constructors")
    }

    #[inline]
    pub fn instance(&self) -> &wgpu::Instance {
        &self.inner().instance
    }

    #[inline]
    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.inner().adapter
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.inner().device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.inner().queue
    }

    #[inline]
    pub fn limits(&self) -> wgpu::Limits {
        self.device().limits()
    }

    /// Extracts the wgpu context out of a GstContext of the matching type
    pub fn map_gst_context_to_wgpu(context: &gst::Context) -> Option<WgpuContext> {
        if context.context_type() != GST_CONTEXT_WGPU_TYPE {
            return None;
        }

        context
            .structure()
            .get::<WgpuContext>(GST_CONTEXT_WGPU_FIELD)
            .ok()
    }

    fn query_context_pad(element: &gst::Element, pad: &gst::Pad) {
        let mut query = gst::query::Context::new(GST_CONTEXT_WGPU_TYPE);
        let remote_element_name = pad
            .peer()
            .and_then(|peer| peer.parent_element())
            .map(|peer| peer.name());

        gst::trace!(
            CAT,
            obj: element,
            "Querying context from pad {} linked to {:?}",
            pad.name(),
            remote_element_name
        );

        if !pad.peer_query(&mut query) {
            return;
        }

        let Some(pad_ctx) = query.context_owned() else {
            return;
        };

        gst::info!(
            CAT,
            obj: element,
            "got context from pad {} linked to {:?}",
            pad.name(),
            remote_element_name
        );

        element.set_context(&pad_ctx);
    }

    fn has_context(element: &gst::Element) -> bool {
        element.context(GST_CONTEXT_WGPU_TYPE).is_some()
    }

    fn query_context_from_pads(element: &gst::Element) -> bool {
        if Self::has_context(element) {
            return true;
        }

        // Downstream first, then upstream
        element.foreach_src_pad(|element, pad| {
            Self::query_context_pad(element, pad);
            !Self::has_context(element)
        });
        if Self::has_context(element) {
            return true;
        }

        element.foreach_sink_pad(|element, pad| {
            Self::query_context_pad(element, pad);
            !Self::has_context(element)
        });
        Self::has_context(element)
    }

    fn query_context_by_message(element: &gst::Element) -> Result<bool, glib::BoolError> {
        let message = gst::message::NeedContext::builder(GST_CONTEXT_WGPU_TYPE)
            .src(element)
            .build();

        gst::trace!(CAT, obj: element, "Posting need WGPU context message");
        if let Err(err) = element.post_message(message) {
            gst::error!(CAT, obj: element, "Failed to post need context message: {}", err);
            return Err(err);
        }

        Ok(Self::has_context(element))
    }

    /// Asks linked peers and then the application for a wgpu context.
    ///
    /// On success the context has already been set on `element`.
    pub fn query_context_from_nearby_elements(
        element: &gst::Element,
    ) -> Result<bool, glib::BoolError> {
        if Self::query_context_from_pads(element) {
            return Ok(true);
        }

        if Self::query_context_by_message(element)? {
            return Ok(true);
        }

        gst::info!(CAT, obj: element, "No WGPU context found in nearby elements");

        Ok(false)
    }
}

mod imp {
    use std::sync::OnceLock;

    use gst::glib::subclass::{object::ObjectImpl, types::ObjectSubclass};

    use crate::glib;

    pub(super) struct Inner {
        #[allow(dead_code)]
        pub instance: wgpu::Instance,
        pub adapter: wgpu::Adapter,
        pub device: wgpu::Device,
        pub queue: wgpu::Queue,
    }

    #[derive(Default)]
    pub struct WgpuContext {
        pub(super) inner: OnceLock<Inner>,
    }

    #[glib::object_subclass]
    impl ObjectSubclass for WgpuContext {
        const NAME: &'static str = "GstDitectorWgpuContext";
        type Type = super::WgpuContext;
        type ParentType = glib::Object;
    }

    impl ObjectImpl for WgpuContext {}
}
