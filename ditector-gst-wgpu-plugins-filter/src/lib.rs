mod ditector;

extern crate gstreamer as gst;
extern crate gstreamer_base as gst_base;
extern crate gstreamer_video as gst_video;

use std::sync::LazyLock;

use gst::glib;

static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "ditectorplugin",
        gst::DebugColorFlags::empty(),
        Some("Ditector plugin registration"),
    )
});

fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    ditector::register(plugin)?;
    gst::info!(
        CAT,
        "plugin loaded successfully (version {})",
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

gst::plugin_define!(
    ditector,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "GPL",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
