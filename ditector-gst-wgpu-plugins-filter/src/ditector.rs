mod imp;

use gst::glib;
use gst::prelude::*;

glib::wrapper! {

    /// Inverts the colours of every frame while `active` is set, passes frames through otherwise
    ///
    /// # Sample pipeline
    /// ```bash
    /// gst-launch-1.0 videotestsrc ! video/x-raw,format=RGBA ! ditector active=true ! videoconvert ! autovideosink
    /// ```
    pub struct Ditector(ObjectSubclass<imp::Ditector>) @extends gst_video::VideoFilter, gst_base::BaseTransform, gst::Element, gst::Object;
}

pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "ditector",
        gst::Rank::NONE,
        Ditector::static_type(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Once};

    use ditector_gst_wgpu::{WgpuContext, GST_CONTEXT_WGPU_TYPE};
    use gst::prelude::*;
    use gst_base::prelude::*;
    use parking_lot::Mutex;

    use super::Ditector;

    const WIDTH: u32 = 3;
    const HEIGHT: u32 = 2;

    fn element() -> gst::Element {
        static REGISTER: Once = Once::new();

        gst::init().unwrap();
        REGISTER.call_once(|| {
            gst::Element::register(None, "ditector", gst::Rank::NONE, Ditector::static_type())
                .unwrap();
        });

        gst::ElementFactory::make("ditector").build().unwrap()
    }

    fn gpu_available() -> bool {
        gst::init().unwrap();
        match WgpuContext::new_headless() {
            Ok(_) => true,
            Err(err) => {
                eprintln!("no wgpu adapter available, skipping: {err}");
                false
            }
        }
    }

    /// The element between a test source pad and a collecting sink pad, playing
    struct Linked {
        element: gst::Element,
        src: gst::Pad,
        _sink: gst::Pad,
        received: Arc<Mutex<Vec<gst::Buffer>>>,
    }

    impl Linked {
        fn new(active: bool) -> Self {
            let element = element();
            element.set_property("active", active);

            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = gst::Pad::builder(gst::PadDirection::Sink)
                .name("collect")
                .event_function(|_pad, _parent, _event| true)
                .chain_function({
                    let received = Arc::clone(&received);
                    move |_pad, _parent, buffer| {
                        received.lock().push(buffer);
                        Ok(gst::FlowSuccess::Ok)
                    }
                })
                .build();
            let src = gst::Pad::builder(gst::PadDirection::Src)
                .name("feed")
                .build();

            src.link(&element.static_pad("sink").unwrap()).unwrap();
            element.static_pad("src").unwrap().link(&sink).unwrap();
            src.set_active(true).unwrap();
            sink.set_active(true).unwrap();

            element.set_state(gst::State::Playing).unwrap();
            assert!(src.push_event(gst::event::StreamStart::new("ditector-test")));

            Self {
                element,
                src,
                _sink: sink,
                received,
            }
        }

        fn negotiate(&self, width: u32, height: u32) -> bool {
            let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
                .build()
                .unwrap();
            let caps = info.to_caps().unwrap();
            if !self.src.push_event(gst::event::Caps::new(&caps)) {
                return false;
            }

            let segment = gst::FormattedSegment::<gst::ClockTime>::new();
            self.src.push_event(gst::event::Segment::new(&segment))
        }
    }

    impl Drop for Linked {
        fn drop(&mut self) {
            let _ = self.element.set_state(gst::State::Null);
        }
    }

    fn test_frame() -> Vec<u8> {
        let mut frame = Vec::with_capacity((WIDTH * HEIGHT * 4) as usize);
        for i in 0..(WIDTH * HEIGHT) as u8 {
            frame.extend_from_slice(&[i * 40, 255 - i * 10, 7, 100 + i]);
        }
        frame
    }

    fn inverted(frame: &[u8]) -> Vec<u8> {
        frame
            .chunks_exact(4)
            .flat_map(|px| [255 - px[0], 255 - px[1], 255 - px[2], px[3]])
            .collect()
    }

    #[test]
    fn inactive_by_default() {
        let element = element();
        assert!(!element.property::<bool>("active"));

        let transform = element.downcast_ref::<gst_base::BaseTransform>().unwrap();
        assert!(transform.is_passthrough());
    }

    #[test]
    fn toggling_active_switches_passthrough() {
        let element = element();
        let transform = element.downcast_ref::<gst_base::BaseTransform>().unwrap();

        element.set_property("active", true);
        assert!(element.property::<bool>("active"));
        assert!(!transform.is_passthrough());

        element.set_property("active", false);
        assert!(!element.property::<bool>("active"));
        assert!(transform.is_passthrough());
    }

    #[test]
    fn active_property_is_described() {
        let element = element();
        let pspec = element.find_property("active").unwrap();
        assert_eq!(pspec.nick(), "Active");
        assert_eq!(pspec.blurb(), Some("True if the effect is active, false if not"));
        assert!(pspec.flags().contains(gst::PARAM_FLAG_MUTABLE_PLAYING));
    }

    #[test]
    fn registered_as_video_effect() {
        let element = element();
        let factory = element.factory().unwrap();
        assert_eq!(factory.metadata("long-name"), Some("Ditector"));
        assert_eq!(factory.metadata("klass"), Some("Filter/Effect/Video"));
        assert_eq!(factory.num_pad_templates(), 2);
    }

    #[test]
    fn unusable_wgpu_context_is_not_kept() {
        let element = element();
        element.set_context(&gst::Context::new(GST_CONTEXT_WGPU_TYPE, true));
        assert!(element.context(GST_CONTEXT_WGPU_TYPE).is_none());
    }

    #[test]
    fn start_falls_back_to_own_context_after_unusable_one() {
        if !gpu_available() {
            return;
        }

        let element = element();
        element.set_context(&gst::Context::new(GST_CONTEXT_WGPU_TYPE, true));
        assert!(element.set_state(gst::State::Paused).is_ok());

        let ctx = element.context(GST_CONTEXT_WGPU_TYPE).unwrap();
        assert!(WgpuContext::map_gst_context_to_wgpu(&ctx).is_some());

        element.set_state(gst::State::Null).unwrap();
    }

    #[test]
    fn own_context_is_announced_after_asking_for_one() {
        if !gpu_available() {
            return;
        }

        let element = element();
        let pipeline = gst::Pipeline::new();
        pipeline.add(&element).unwrap();
        let bus = pipeline.bus().unwrap();

        pipeline.set_state(gst::State::Paused).unwrap();

        let mut need_at = None;
        let mut have_at = None;
        let mut pos = 0;
        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::NeedContext(m) if m.context_type() == GST_CONTEXT_WGPU_TYPE => {
                    need_at.get_or_insert(pos);
                }
                gst::MessageView::HaveContext(m)
                    if m.context().context_type() == GST_CONTEXT_WGPU_TYPE =>
                {
                    assert!(WgpuContext::map_gst_context_to_wgpu(&m.context()).is_some());
                    have_at.get_or_insert(pos);
                }
                _ => {}
            }
            pos += 1;
        }

        let (need_at, have_at) = (need_at.unwrap(), have_at.unwrap());
        assert!(need_at < have_at);

        pipeline.set_state(gst::State::Null).unwrap();
    }

    #[test]
    fn active_frame_is_inverted_in_place() {
        if !gpu_available() {
            return;
        }

        let linked = Linked::new(true);
        assert!(linked.negotiate(WIDTH, HEIGHT));

        let frame = test_frame();
        let expected = inverted(&frame);
        assert_eq!(
            linked.src.push(gst::Buffer::from_mut_slice(frame)),
            Ok(gst::FlowSuccess::Ok)
        );

        let received = linked.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].map_readable().unwrap().as_slice(), &expected[..]);
    }

    #[test]
    fn inactive_frame_is_left_untouched() {
        if !gpu_available() {
            return;
        }

        let linked = Linked::new(false);
        assert!(linked.negotiate(WIDTH, HEIGHT));

        let frame = test_frame();
        assert_eq!(
            linked.src.push(gst::Buffer::from_mut_slice(frame.clone())),
            Ok(gst::FlowSuccess::Ok)
        );

        let received = linked.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].map_readable().unwrap().as_slice(), &frame[..]);
    }

    #[test]
    fn toggling_while_playing_applies_to_next_frame() {
        if !gpu_available() {
            return;
        }

        let linked = Linked::new(false);
        assert!(linked.negotiate(WIDTH, HEIGHT));

        let frame = test_frame();
        linked
            .src
            .push(gst::Buffer::from_mut_slice(frame.clone()))
            .unwrap();
        linked.element.set_property("active", true);
        linked
            .src
            .push(gst::Buffer::from_mut_slice(frame.clone()))
            .unwrap();

        let received = linked.received.lock();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].map_readable().unwrap().as_slice(), &frame[..]);
        assert_eq!(
            received[1].map_readable().unwrap().as_slice(),
            &inverted(&frame)[..]
        );
    }

    #[test]
    fn short_frame_is_a_flow_error() {
        if !gpu_available() {
            return;
        }

        let linked = Linked::new(true);
        assert!(linked.negotiate(WIDTH, HEIGHT));

        assert_eq!(
            linked.src.push(gst::Buffer::from_mut_slice(vec![0u8; 8])),
            Err(gst::FlowError::Error)
        );
        assert!(linked.received.lock().is_empty());
    }

    #[test]
    fn caps_above_texture_limit_are_refused() {
        if !gpu_available() {
            return;
        }

        let linked = Linked::new(true);
        let max = wgpu::Limits::default().max_texture_dimension_2d;
        assert!(!linked.negotiate(max + 1, HEIGHT));
    }
}
