//! Locates and extracts the verbatim source text of C++ function definitions.
//!
//! A requirement names a function by signature; the signature's type strings
//! come from the Web backend and may differ lexically from what Clang reports
//! (`vector<int>` vs `std::vector<int>`, aliases, whitespace). Matching is
//! therefore done on canonical spellings: each signature type is re-parsed in
//! the translation unit's own context by appending a synthesized variable
//! declaration to an unsaved copy of the source, which makes every typedef,
//! alias and namespace visible at file scope resolve exactly as the
//! submission resolves it. The amendment is strictly additive at end-of-file
//! and the original TU is parsed separately, so no cursor location is
//! perturbed.

use crate::client::model::{FunctionRequirement, FunctionSignature};
use clang::{Clang, Entity, EntityKind, EntityVisitResult, Index, Unsaved};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

const TMP_VAR_PREFIX: &str = "__judger_tmp_var_for_parse_";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("libclang is unavailable: {0}")]
    Clang(String),
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("cannot read compile_commands.json at {path}: {source}")]
    CompileDbIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed compile_commands.json: {0}")]
    CompileDbFormat(#[from] serde_json::Error),
    #[error("malformed compile command for {file}: {message}")]
    CompileDbCommand { file: String, message: String },
    #[error("cannot find system include paths: {0}")]
    SystemInclude(String),
    #[error("function name containing multiple \"::\" is not supported: {0}")]
    UnsupportedName(String),
    #[error("source path {0} escapes the working directory")]
    PathEscape(PathBuf),
    #[error("cannot read source file {path}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot determine the source extent of {0}")]
    Extent(String),
}

pub struct FunctionExtractor {
    clang: Clang,
    workdir: PathBuf,
    commands: HashMap<PathBuf, Vec<String>>,
    system_includes: OnceCell<Vec<String>>,
}

impl FunctionExtractor {
    /// `workdir` is the template root; the compilation database is expected
    /// at `workdir/build/compile_commands.json`.
    pub fn new(workdir: &Path) -> Result<FunctionExtractor, ExtractError> {
        let clang = Clang::new().map_err(ExtractError::Clang)?;
        let db_path = workdir.join("build").join("compile_commands.json");
        let raw = std::fs::read_to_string(&db_path).map_err(|source| {
            ExtractError::CompileDbIo { path: db_path.clone(), source }
        })?;
        let commands = parse_compile_commands(&raw)?;
        log::info!(
            "function extractor loaded {} compile commands from {}",
            commands.len(),
            db_path.display()
        );
        Ok(FunctionExtractor {
            clang,
            workdir: workdir.to_owned(),
            commands,
            system_includes: OnceCell::new(),
        })
    }

    /// Extract the implementation text for one requirement.
    ///
    /// `Ok(None)` means the requirement is unmatchable in the submission (no
    /// definition, no compile command, missing file, uncanonicalizable type);
    /// the pipeline turns that into a `failed` verdict. `Err` is an internal
    /// fault and becomes an `error` verdict.
    pub fn extract(&self, requirement: &FunctionRequirement) -> Result<Option<String>, ExtractError> {
        let signature = &requirement.function_signature;
        let matcher = NameMatcher::parse(&signature.name)?;

        let source_file = match self.resolve_source_path(&requirement.source_file_path)? {
            Some(path) => path,
            None => {
                log::warn!(
                    "source file {} does not exist in the working directory",
                    requirement.source_file_path
                );
                return Ok(None);
            }
        };

        let args = match self.command_for(&source_file) {
            Some(raw) => {
                let mut args = pipeline_arguments(raw);
                for path in self.system_include_paths()? {
                    args.push("-isystem".to_owned());
                    args.push(path.clone());
                }
                args
            }
            None => {
                log::error!("compile commands of {} not found", source_file.display());
                return Ok(None);
            }
        };
        log::debug!("compilation args: {:?}", args);

        let index = Index::new(&self.clang, false, false);
        let tu = index
            .parser(&source_file)
            .arguments(&args)
            .parse()
            .map_err(|e| ExtractError::Parse {
                path: source_file.clone(),
                message: e.to_string(),
            })?;

        let type_names = signature.distinct_types();
        log::info!("trying to parse {} signature types", type_names.len());
        let canonical =
            self.canonicalize_types(&index, &source_file, &args, &type_names)?;
        for name in &type_names {
            if !canonical.contains_key(name) {
                log::warn!(
                    "type `{}` cannot be parsed in the context of {}",
                    name,
                    source_file.display()
                );
                return Ok(None);
            }
        }

        log::info!("trying to match the signature of {}", signature.name);
        let definition = find_definition(tu.get_entity(), &matcher, signature, &canonical);
        let definition = match definition {
            Some(entity) => entity,
            None => {
                log::warn!(
                    "signature of {} does not match any source code",
                    signature.name
                );
                return Ok(None);
            }
        };

        let body = compound_body(&definition)
            .ok_or_else(|| ExtractError::Extent(signature.name.clone()))?;
        self.extract_text(&source_file, &signature.name, &definition, &body)
            .map(Some)
    }

    /// Resolve a backend-supplied relative path against the working
    /// directory, refusing anything that escapes it. `Ok(None)` if the file
    /// does not exist.
    fn resolve_source_path(&self, relative: &str) -> Result<Option<PathBuf>, ExtractError> {
        let candidate = self.workdir.join(relative);
        let canonical = match candidate.canonicalize() {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        let root = self
            .workdir
            .canonicalize()
            .map_err(|source| ExtractError::SourceRead { path: self.workdir.clone(), source })?;
        if !canonical.starts_with(&root) {
            return Err(ExtractError::PathEscape(candidate));
        }
        Ok(Some(canonical))
    }

    fn command_for(&self, source_file: &Path) -> Option<&Vec<String>> {
        if let Some(raw) = self.commands.get(source_file) {
            return Some(raw);
        }
        source_file
            .canonicalize()
            .ok()
            .and_then(|p| self.commands.get(&p))
    }

    /// Re-parse every signature type in the source file's own context and
    /// map it to its canonical spelling.
    fn canonicalize_types(
        &self,
        index: &Index<'_>,
        source_file: &Path,
        args: &[String],
        type_names: &[String],
    ) -> Result<HashMap<String, String>, ExtractError> {
        let source_text = std::fs::read_to_string(source_file).map_err(|source| {
            ExtractError::SourceRead { path: source_file.to_owned(), source }
        })?;
        let amended = synthesize_amendment(&source_text, type_names);

        let overlay = index
            .parser(source_file)
            .arguments(args)
            .unsaved(&[Unsaved::new(source_file, amended)])
            .parse()
            .map_err(|e| ExtractError::Parse {
                path: source_file.to_owned(),
                message: e.to_string(),
            })?;
        for diagnostic in overlay.get_diagnostics() {
            log::warn!("amended overlay: {}", diagnostic.get_text());
        }

        let mut canonical = HashMap::new();
        overlay.get_entity().visit_children(|entity, _| {
            if entity.get_kind() == EntityKind::VarDecl {
                if let Some(i) = synthesized_index(entity.get_name().as_deref()) {
                    if let (Some(ty), Some(name)) = (entity.get_type(), type_names.get(i)) {
                        let spelling = ty.get_canonical_type().get_display_name();
                        log::debug!("type {} parsed to: {}", name, spelling);
                        canonical.insert(name.clone(), spelling);
                    }
                }
            }
            EntityVisitResult::Recurse
        });
        Ok(canonical)
    }

    /// The extent to extract runs from the start of the declaration to the
    /// end of the compound body, both endpoints inclusive.
    fn extract_text(
        &self,
        source_file: &Path,
        name: &str,
        definition: &Entity<'_>,
        body: &Entity<'_>,
    ) -> Result<String, ExtractError> {
        let extent = || ExtractError::Extent(name.to_owned());
        let start = definition
            .get_range()
            .ok_or_else(extent)?
            .get_start()
            .get_file_location();
        let end = body
            .get_range()
            .ok_or_else(extent)?
            .get_end()
            .get_file_location();

        let mut path = start
            .file
            .map(|f| f.get_path())
            .unwrap_or_else(|| source_file.to_owned());
        if path.is_relative() {
            path = self.workdir.join(path);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ExtractError::SourceRead { path: path.clone(), source })?;
        let lines: Vec<&str> = text.lines().collect();
        splice_extent(&lines, start.line, start.column, end.line, end.column)
            .ok_or_else(extent)
    }

    /// The compiler's own standard-library search paths. libclang is not a
    /// full driver, so these have to be supplied explicitly; probed once and
    /// cached.
    fn system_include_paths(&self) -> Result<&[String], ExtractError> {
        self.system_includes
            .get_or_try_init(|| {
                let output = Command::new("clang++")
                    .args(["-E", "-x", "c++", "-", "-v"])
                    .stdin(Stdio::null())
                    .output()
                    .map_err(|e| {
                        ExtractError::SystemInclude(format!("failed to call clang++: {}", e))
                    })?;
                parse_system_include_paths(&String::from_utf8_lossy(&output.stderr))
            })
            .map(|v| v.as_slice())
    }
}

/// `Class::method` or a free function name. More than one `::` is rejected.
#[derive(Debug, PartialEq, Eq)]
struct NameMatcher<'a> {
    class: Option<&'a str>,
    name: &'a str,
}

impl<'a> NameMatcher<'a> {
    fn parse(name: &'a str) -> Result<NameMatcher<'a>, ExtractError> {
        let parts: Vec<&str> = name.split("::").collect();
        match parts.as_slice() {
            [name] => Ok(NameMatcher { class: None, name }),
            [class, method] => Ok(NameMatcher { class: Some(class), name: method }),
            _ => Err(ExtractError::UnsupportedName(name.to_owned())),
        }
    }
}

/// Pre-order search for the first signature match that carries a body. A
/// matching cursor without a compound body is a pure declaration; the
/// definition, if this TU has one, appears later in the walk.
fn find_definition<'tu>(
    root: Entity<'tu>,
    matcher: &NameMatcher<'_>,
    signature: &FunctionSignature,
    canonical: &HashMap<String, String>,
) -> Option<Entity<'tu>> {
    let mut found = None;
    root.visit_children(|entity, _| {
        if !matches!(entity.get_kind(), EntityKind::FunctionDecl | EntityKind::Method) {
            return EntityVisitResult::Recurse;
        }
        if !entity_matches(&entity, matcher, signature, canonical) {
            return EntityVisitResult::Recurse;
        }
        match compound_body(&entity) {
            Some(_) => {
                found = Some(entity);
                EntityVisitResult::Break
            }
            None => EntityVisitResult::Recurse,
        }
    });
    found
}

fn entity_matches(
    entity: &Entity<'_>,
    matcher: &NameMatcher<'_>,
    signature: &FunctionSignature,
    canonical: &HashMap<String, String>,
) -> bool {
    if entity.get_name().as_deref() != Some(matcher.name) {
        return false;
    }
    if let Some(class) = matcher.class {
        let parent = match entity.get_semantic_parent() {
            Some(parent) => parent,
            None => return false,
        };
        if !matches!(parent.get_kind(), EntityKind::ClassDecl | EntityKind::StructDecl) {
            return false;
        }
        if parent.get_name().as_deref() != Some(class) {
            return false;
        }
    }

    let result_type = match entity.get_result_type() {
        Some(ty) => ty.get_canonical_type().get_display_name(),
        None => return false,
    };
    if canonical.get(&signature.return_type) != Some(&result_type) {
        return false;
    }

    let arguments = entity.get_arguments().unwrap_or_default();
    if arguments.len() != signature.parameters.len() {
        return false;
    }
    arguments.iter().zip(&signature.parameters).all(|(argument, parameter)| {
        match argument.get_type() {
            Some(ty) => {
                let spelling = ty.get_canonical_type().get_display_name();
                canonical.get(&parameter.ty) == Some(&spelling)
            }
            None => false,
        }
    })
}

fn compound_body<'tu>(entity: &Entity<'tu>) -> Option<Entity<'tu>> {
    entity
        .get_children()
        .into_iter()
        .find(|child| child.get_kind() == EntityKind::CompoundStmt)
}

fn synthesized_index(name: Option<&str>) -> Option<usize> {
    name?
        .strip_prefix(TMP_VAR_PREFIX)?
        .strip_suffix("__")?
        .parse()
        .ok()
}

/// One `[[maybe_unused]]` variable declaration per signature type, appended
/// after the original text so no prior location shifts.
fn synthesize_amendment(source: &str, type_names: &[String]) -> String {
    let mut amended = source.to_owned();
    if !amended.is_empty() && !amended.ends_with('\n') {
        amended.push('\n');
    }
    for (i, name) in type_names.iter().enumerate() {
        amended.push_str(&format!(
            "[[maybe_unused]] {} {}{}__;\n",
            name, TMP_VAR_PREFIX, i
        ));
    }
    amended
}

/// CMake's exporter emits `<driver> <flags…> -c <file>`: the driver and the
/// trailing input pair are not arguments libclang should see.
fn pipeline_arguments(raw: &[String]) -> Vec<String> {
    raw.get(1..raw.len().saturating_sub(2))
        .unwrap_or_default()
        .to_vec()
}

#[derive(Debug, Deserialize)]
struct CompileCommandEntry {
    directory: String,
    file: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
}

fn parse_compile_commands(raw: &str) -> Result<HashMap<PathBuf, Vec<String>>, ExtractError> {
    let entries: Vec<CompileCommandEntry> = serde_json::from_str(raw)?;
    let mut commands = HashMap::new();
    for entry in entries {
        let arguments = match (entry.arguments, &entry.command) {
            (Some(arguments), _) => arguments,
            (None, Some(command)) => shell_words::split(command).map_err(|e| {
                ExtractError::CompileDbCommand {
                    file: entry.file.clone(),
                    message: e.to_string(),
                }
            })?,
            (None, None) => {
                return Err(ExtractError::CompileDbCommand {
                    file: entry.file.clone(),
                    message: "entry has neither \"command\" nor \"arguments\"".to_owned(),
                })
            }
        };
        let mut file = PathBuf::from(&entry.file);
        if file.is_relative() {
            file = Path::new(&entry.directory).join(file);
        }
        let file = file.canonicalize().unwrap_or(file);
        commands.insert(file, arguments);
    }
    Ok(commands)
}

/// Slice the stderr of `clang++ -E -x c++ - -v` down to the `#include <...>`
/// search list.
fn parse_system_include_paths(output: &str) -> Result<Vec<String>, ExtractError> {
    const START: &str = "#include <...> search starts here:";
    const END: &str = "End of search list.";

    let start = output.find(START).ok_or_else(|| {
        ExtractError::SystemInclude("beginning of include paths not found in clang++ output".into())
    })?;
    let section = &output[start + START.len()..];
    let end = section.find(END).ok_or_else(|| {
        ExtractError::SystemInclude("end of include paths not found in clang++ output".into())
    })?;

    Ok(section[..end]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("ignoring nonexistent directory"))
        .map(str::to_owned)
        .collect())
}

/// Splice `[start, end]` (both 1-based, both inclusive) out of `lines`,
/// which carry no trailing newlines. Columns are byte offsets as libclang
/// reports them.
fn splice_extent(
    lines: &[&str],
    start_line: u32,
    start_column: u32,
    end_line: u32,
    end_column: u32,
) -> Option<String> {
    let start_line = (start_line as usize).checked_sub(1)?;
    let start_column = (start_column as usize).checked_sub(1)?;
    let end_line = (end_line as usize).checked_sub(1)?;
    let end_column = end_column as usize;

    if start_line == end_line {
        let line = lines.get(start_line)?;
        return line.get(start_column..end_column.min(line.len())).map(str::to_owned);
    }

    let mut body = lines.get(start_line)?.get(start_column..)?.to_owned();
    body.push('\n');
    for line in lines.get(start_line + 1..end_line)? {
        body.push_str(line);
        body.push('\n');
    }
    let last = lines.get(end_line)?;
    body.push_str(last.get(..end_column.min(last.len()))?);
    Some(body)
}
