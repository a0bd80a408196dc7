use gilib::settings::RenderSettings;

fn main() {
    gilib::init_logging();
    let path = std::env::args().nth(1).unwrap_or_else(|| "settings.json".to_owned());
    let settings = RenderSettings::load_from_path(path);
    if let Err(err) = gilib::run(settings) {
        eprintln!("Application error: {err}");
    }
}
