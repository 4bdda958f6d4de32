//! Fixed .NET project layout and toolchain commands

use crate::types::SourceFile;

pub const MANIFEST_PATH: &str = "Program.csproj";
pub const SOURCE_PATH: &str = "Program.cs";
pub const TARGET_FRAMEWORK: &str = "net8.0";

/// Package source used by the offline restore stage; the shared cache volume
pub const LOCAL_PACKAGE_SOURCE: &str = "/root/.nuget/packages";
pub const REMOTE_PACKAGE_SOURCE: &str = "https://api.nuget.org/v3/index.json";

/// Build manifest naming `Program.cs` as the only compilation unit
pub fn manifest() -> String {
    format!(
        r#"<Project Sdk="Microsoft.NET.Sdk">

  <PropertyGroup>
    <OutputType>Exe</OutputType>
    <TargetFramework>{framework}</TargetFramework>
    <ImplicitUsings>enable</ImplicitUsings>
    <Nullable>enable</Nullable>
    <EnableDefaultCompileItems>false</EnableDefaultCompileItems>
  </PropertyGroup>

  <ItemGroup>
    <Compile Include="{source}" />
  </ItemGroup>

</Project>
"#,
        framework = TARGET_FRAMEWORK,
        source = SOURCE_PATH,
    )
}

/// Files injected for one submission, manifest first
pub fn files(code: &str) -> Vec<SourceFile> {
    vec![
        SourceFile::new(MANIFEST_PATH, manifest()),
        SourceFile::new(SOURCE_PATH, code.to_string()),
    ]
}

/// Environment for every toolchain command. Keeps the SDK from touching the
/// network for telemetry or first-run setup.
pub fn environment() -> [(&'static str, &'static str); 3] {
    [
        ("DOTNET_CLI_TELEMETRY_OPTOUT", "1"),
        ("DOTNET_NOLOGO", "1"),
        ("DOTNET_SKIP_FIRST_TIME_EXPERIENCE", "1"),
    ]
}

pub fn offline_restore() -> Vec<&'static str> {
    vec!["dotnet", "restore", "--source", LOCAL_PACKAGE_SOURCE]
}

pub fn online_restore() -> Vec<&'static str> {
    vec!["dotnet", "restore", "--source", REMOTE_PACKAGE_SOURCE]
}

pub fn build() -> Vec<&'static str> {
    vec![
        "dotnet",
        "build",
        "--no-restore",
        "--disable-build-servers",
        "-p:UseSharedCompilation=false",
        "-c",
        "Release",
        "-o",
        "out",
        "-nologo",
        "-v",
        "q",
    ]
}

pub fn run() -> Vec<&'static str> {
    vec!["dotnet", "out/Program.dll"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_compiles_only_program_cs() {
        let manifest = manifest();
        assert!(manifest.contains("<TargetFramework>net8.0</TargetFramework>"));
        assert!(manifest.contains("<EnableDefaultCompileItems>false</EnableDefaultCompileItems>"));
        assert_eq!(manifest.matches("<Compile Include=").count(), 1);
        assert!(manifest.contains(r#"<Compile Include="Program.cs" />"#));
    }

    #[test]
    fn test_files_in_injection_order() {
        let files = files("class P {}");
        assert_eq!(files[0].path, "Program.csproj");
        assert_eq!(files[1].path, "Program.cs");
        assert_eq!(&files[1].content[..], b"class P {}");
    }

    #[test]
    fn test_restore_stages_differ_only_in_source() {
        let offline = offline_restore();
        let online = online_restore();
        assert_eq!(offline[..3], online[..3]);
        assert_eq!(offline[3], LOCAL_PACKAGE_SOURCE);
        assert_eq!(online[3], REMOTE_PACKAGE_SOURCE);
    }
}
