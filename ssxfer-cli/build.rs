use vergen::EmitBuilder;

fn main() {
    // Embed cargo build metadata so `--version` can report how the binary was built.  Git
    // metadata is deliberately not included since it isn't available when the crate is compiled
    // from a published release by `cargo install`.
    EmitBuilder::builder()
        .all_cargo()
        .emit()
        .expect("BUG: emitting build metadata can't fail for the cargo-only config");
}
