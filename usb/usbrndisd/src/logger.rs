use redox_log::{OutputBuilder, RedoxLogger};

/// Logs to stderr; on Redox also to this daemon's files in the logging
/// scheme.
#[cfg_attr(not(target_os = "redox"), allow(unused_mut))]
pub fn init(level: log::LevelFilter) {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    for (logfile, ansi) in [("usbrndisd.log", false), ("usbrndisd.ansi.log", true)] {
        match OutputBuilder::in_redox_logging_scheme("usb", "net", logfile.to_string()) {
            Ok(b) => {
                let mut b = b.with_filter(level).flush_on_newline(true);
                if ansi {
                    b = b.with_ansi_escape_codes();
                }
                logger = logger.with_output(b.build());
            }
            Err(error) => eprintln!("Failed to create {logfile}: {}", error),
        }
    }

    logger.enable().expect("usbrndisd: failed to set default logger");
}
