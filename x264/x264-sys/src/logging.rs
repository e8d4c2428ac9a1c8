use std::{
    borrow::Cow,
    ffi::{c_char, c_int, CStr},
    panic,
    process::abort,
};

#[no_mangle]
extern "C" fn rust_x264_log_callback(level: c_int, message: *const c_char) {
    let r = panic::catch_unwind(|| {
        let buf = unsafe { CStr::from_ptr(message) }.to_string_lossy();
        if level == crate::X264_LOG_DEBUG as c_int {
            log::debug!("{buf}");
        } else if level == crate::X264_LOG_INFO as c_int {
            log::info!("{buf}");
        } else if level == crate::X264_LOG_WARNING as c_int {
            log::warn!("{buf}");
        } else if level == crate::X264_LOG_ERROR as c_int {
            log::error!("{buf}");
        } else if level == crate::X264_LOG_NONE as c_int {
            // Do nothing
        } else {
            log::error!("x264 log level {level} unrecognized, message was {buf}");
        }
    });
    if let Err(e) = r {
        // Dropping anything other than a string payload could panic again.
        let cast_to_cow = e
            .downcast::<String>()
            .map(|b| *b)
            .map(Cow::Owned)
            .or_else(|e| e.downcast::<&'static str>().map(|b| *b).map(Cow::Borrowed));
        if cast_to_cow.is_err() {
            abort();
        }
    }
}
