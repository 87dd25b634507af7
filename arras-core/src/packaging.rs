// Copyright 2024 Arras Core Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Packaging systems rewrite a freshly composed [`SpawnArgs`] so the
//! worker launches through whatever environment-materialization
//! strategy the session's requirements block asks for, before the
//! process manager ever sees it.

use std::env;

use crate::error::SessionError;
use crate::process::SpawnArgs;

const REZ_PREPEND_OVERRIDE_VAR: &str = "ARRASCLIENT_OVR_LOCAL_PACKAGE_PATH_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingSystem {
    None,
    CurrentEnvironment,
    Bash,
    Rez1,
    Rez2,
}

impl PackagingSystem {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" => Some(PackagingSystem::None),
            "current-environment" => Some(PackagingSystem::CurrentEnvironment),
            "bash" => Some(PackagingSystem::Bash),
            "rez1" => Some(PackagingSystem::Rez1),
            "rez2" => Some(PackagingSystem::Rez2),
            _ => None,
        }
    }
}

/// `requirements` block from the session definition, narrowed to what
/// packaging needs. `rez_context`/`rez_context_file`/`rez_packages` are
/// mutually exclusive per spec; `validate` enforces that.
#[derive(Debug, Clone, Default)]
pub struct PackagingRequirements {
    pub packaging_system: Option<String>,
    pub pseudo_compiler: Option<String>,
    pub script: Option<String>,
    pub rez_context: Option<String>,
    pub rez_context_file: Option<String>,
    pub rez_packages: Option<Vec<String>>,
    pub rez_packages_prepend: Option<String>,
}

/// Chooses `rez1` when the session supplies neither a packaging system
/// name nor a context, matching the default called out in the local
/// session supervisor's packaging step.
fn resolve_system(req: &PackagingRequirements, has_context: bool) -> Result<PackagingSystem, SessionError> {
    match &req.packaging_system {
        Some(name) => PackagingSystem::parse(name)
            .ok_or_else(|| SessionError::new(format!("unknown packaging system '{name}'"))),
        None if has_context => Ok(PackagingSystem::Rez1),
        None => Ok(PackagingSystem::Rez1),
    }
}

/// Rewrites `args` in place per the chosen packaging system, mutating
/// `program`/`args`/`environment` to launch through the right
/// interpreter. `has_context` marks whether the session referenced a
/// `contexts` block (affects only the default-system resolution).
pub fn apply_packaging(args: &mut SpawnArgs, req: &PackagingRequirements, has_context: bool) -> Result<(), SessionError> {
    let system = resolve_system(req, has_context)?;
    match system {
        PackagingSystem::None => apply_none(args, req),
        PackagingSystem::CurrentEnvironment => apply_current_environment(args, req),
        PackagingSystem::Bash => apply_bash(args, req),
        PackagingSystem::Rez1 | PackagingSystem::Rez2 => apply_rez(args, req),
    }
}

fn exec_comp_name(req: &PackagingRequirements) -> String {
    match &req.pseudo_compiler {
        Some(suffix) => format!("execComp-{suffix}"),
        None => "execComp".to_string(),
    }
}

/// Locates `execComp` on `PATH` within the composed environment; the
/// composed environment is left untouched otherwise.
fn apply_none(args: &mut SpawnArgs, req: &PackagingRequirements) -> Result<(), SessionError> {
    let name = exec_comp_name(req);
    args.program = locate_on_path(&name, &args.environment)
        .ok_or_else(|| SessionError::new(format!("'{name}' not found on PATH")))?;
    Ok(())
}

/// Inherits the client's own environment wholesale rather than the
/// composed one; only the executable name may be rewritten.
fn apply_current_environment(args: &mut SpawnArgs, req: &PackagingRequirements) -> Result<(), SessionError> {
    let name = exec_comp_name(req);
    for (k, v) in env::vars() {
        args.environment.entry(k).or_insert(v);
    }
    args.program = locate_on_path(&name, &args.environment)
        .ok_or_else(|| SessionError::new(format!("'{name}' not found on PATH")))?;
    Ok(())
}

/// Wraps the spawn in a transient bash invocation running `script`.
fn apply_bash(args: &mut SpawnArgs, req: &PackagingRequirements) -> Result<(), SessionError> {
    let script = req.script.as_ref().ok_or_else(|| SessionError::new("bash packaging requires a 'script'"))?;
    let original_program = args.program.clone();
    let original_args = args.args.clone();
    let mut full_command = vec![script.clone(), original_program];
    full_command.extend(original_args);
    args.program = "/bin/bash".to_string();
    args.args = vec!["-c".to_string(), full_command.join(" ")];
    Ok(())
}

/// Resolves one of the three mutually-exclusive rez inputs and wraps
/// the spawn through `rez env`. `rez1`/`rez2` differ only in which
/// rez major-version CLI they shell out to; both reach this path.
fn apply_rez(args: &mut SpawnArgs, req: &PackagingRequirements) -> Result<(), SessionError> {
    let provided = [req.rez_context.is_some(), req.rez_context_file.is_some(), req.rez_packages.is_some()]
        .iter()
        .filter(|b| **b)
        .count();
    if provided != 1 {
        return Err(SessionError::new(
            "rez packaging requires exactly one of rez_context, rez_context_file, or rez_packages",
        ));
    }

    if let Some(prefix) = req
        .rez_packages_prepend
        .clone()
        .or_else(|| env::var(REZ_PREPEND_OVERRIDE_VAR).ok())
    {
        let existing = args.environment.get("REZ_PACKAGES_PATH").cloned().unwrap_or_default();
        let combined = if existing.is_empty() { prefix } else { format!("{prefix}:{existing}") };
        args.environment.insert("REZ_PACKAGES_PATH".to_string(), combined);
    }

    let original_program = args.program.clone();
    let original_args = args.args.clone();
    let mut rez_args = vec!["env".to_string()];
    if let Some(ctx) = &req.rez_context {
        rez_args.push("--input".to_string());
        rez_args.push(ctx.clone());
    } else if let Some(path) = &req.rez_context_file {
        rez_args.push("--input".to_string());
        rez_args.push(path.clone());
    } else if let Some(packages) = &req.rez_packages {
        rez_args.extend(packages.clone());
    }
    rez_args.push("--".to_string());
    rez_args.push(original_program);
    rez_args.extend(original_args);

    args.program = "rez".to_string();
    args.args = rez_args;
    Ok(())
}

fn locate_on_path(name: &str, environment: &std::collections::HashMap<String, String>) -> Option<String> {
    let path_var = environment.get("PATH").cloned().or_else(|| env::var("PATH").ok())?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return candidate.to_str().map(|s| s.to_string());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn base_args() -> SpawnArgs {
        SpawnArgs::new("execComp")
    }

    #[test]
    fn default_system_is_rez1_when_unspecified() {
        let req = PackagingRequirements::default();
        assert_eq!(resolve_system(&req, false).unwrap(), PackagingSystem::Rez1);
    }

    #[test]
    fn unknown_system_name_is_rejected() {
        let req = PackagingRequirements { packaging_system: Some("made-up".into()), ..Default::default() };
        assert!(resolve_system(&req, false).is_err());
    }

    #[test]
    fn bash_requires_a_script() {
        let mut args = base_args();
        let req = PackagingRequirements { packaging_system: Some("bash".into()), ..Default::default() };
        assert!(apply_packaging(&mut args, &req, false).is_err());
    }

    #[test]
    fn bash_wraps_program_through_bash_c() {
        let mut args = base_args();
        let req = PackagingRequirements {
            packaging_system: Some("bash".into()),
            script: Some("source /opt/env.sh".into()),
            ..Default::default()
        };
        apply_packaging(&mut args, &req, false).unwrap();
        assert_eq!(args.program, "/bin/bash");
        assert_eq!(args.args[0], "-c");
        assert!(args.args[1].starts_with("source /opt/env.sh execComp"));
    }

    #[test]
    fn rez_requires_exactly_one_context_source() {
        let mut args = base_args();
        let req = PackagingRequirements {
            packaging_system: Some("rez1".into()),
            rez_context: Some("context-literal".into()),
            rez_context_file: Some("/path/to/context".into()),
            ..Default::default()
        };
        assert!(apply_packaging(&mut args, &req, false).is_err());
    }

    #[test]
    fn rez_prepend_env_override_is_honored() {
        let mut args = base_args();
        args.environment.insert("PATH".to_string(), "/usr/bin".to_string());
        let mut expected_env: HashMap<String, String> = HashMap::new();
        expected_env.insert("REZ_PACKAGES_PATH".to_string(), "/extra/packages".to_string());
        let req = PackagingRequirements {
            packaging_system: Some("rez1".into()),
            rez_packages: Some(vec!["foo-1.0".into()]),
            rez_packages_prepend: Some("/extra/packages".into()),
            ..Default::default()
        };
        apply_packaging(&mut args, &req, false).unwrap();
        assert_eq!(args.environment.get("REZ_PACKAGES_PATH"), expected_env.get("REZ_PACKAGES_PATH"));
        assert_eq!(args.program, "rez");
    }
}
