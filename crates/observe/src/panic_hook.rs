/// Chains a hook onto the default panic handler so that panics also show up
/// in the tracing output, where operators are actually looking.
pub fn install() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("thread panicked: {info}");
        default_hook(info);
    }));
}
