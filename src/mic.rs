use cpal::traits::HostTrait;

/// Returns true when the default audio host exposes a capture device.
///
/// Checked on every start attempt: the vendor platform needs a working
/// microphone on this machine before a call is worth opening.
pub fn microphone_available() -> bool {
    cpal::default_host().default_input_device().is_some()
}
