mod app_flow;
mod config_files;
mod session_scenarios;
