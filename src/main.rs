use cpsam_export::{check_exported_model, run, ExportConfig, HttpTransport};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ExportConfig::default();
    let transport = HttpTransport::new()?;
    let summary = run(&config, &transport)?;

    for input in &summary.inputs {
        tracing::info!("input {}: {:?}", input.name, input.shape);
    }
    for output in &summary.outputs {
        tracing::info!("output {}: {:?}", output.name, output.shape);
    }
    tracing::info!("{} nodes, {} initializers", summary.node_count, summary.initializer_count);

    let check = check_exported_model(&config.output_path, &config)?;
    tracing::info!("output {:?}, style {:?}", check.output_shape, check.style_shape);
    Ok(())
}
