//! Client package contents
//!
//! Layout of the ZIP handed to a device:
//!
//! ```text
//! <device>/ca.crt
//! <device>/host.crt
//! <device>/host.key
//! <device>/config.yaml
//! <device>/install.sh | install.bat    (desktop platforms only)
//! <device>/README.md
//! ```

use nebula_console_common::{DeviceType, Result};

use crate::archive::{ArchiveBuilder, MODE_EXECUTABLE, MODE_PRIVATE, MODE_PUBLIC};

/// Nebula release fetched by the install scripts
pub const NEBULA_RELEASE: &str = "v1.8.2";

pub const UNIX_PKI_DIR: &str = "/etc/nebula";
pub const WINDOWS_PKI_DIR: &str = r"C:\Program Files\Nebula\config";

/// Where the installed config expects its PKI files
pub fn pki_dir(device: DeviceType) -> (&'static str, char) {
    if device.is_mobile() {
        // Mobile apps import the files themselves.
        return (".", '/');
    }
    match device {
        DeviceType::Windows => (WINDOWS_PKI_DIR, '\\'),
        _ => (UNIX_PKI_DIR, '/'),
    }
}

pub struct PackageContents<'a> {
    pub device_name: &'a str,
    pub device_type: DeviceType,
    pub ip_address: &'a str,
    pub auto_connect: bool,
    pub ca_pem: &'a str,
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
    pub config_yaml: &'a str,
    /// Overlay address to ping once connected
    pub lighthouse_ip: Option<&'a str>,
}

pub fn build(contents: &PackageContents<'_>) -> Result<Vec<u8>> {
    let dir = contents.device_name;
    let mut archive = ArchiveBuilder::new();
    archive.add(&format!("{}/ca.crt", dir), contents.ca_pem.as_bytes(), MODE_PUBLIC)?;
    archive.add(&format!("{}/host.crt", dir), contents.cert_pem.as_bytes(), MODE_PUBLIC)?;
    archive.add(&format!("{}/host.key", dir), contents.key_pem.as_bytes(), MODE_PRIVATE)?;
    archive.add(&format!("{}/config.yaml", dir), contents.config_yaml.as_bytes(), MODE_PUBLIC)?;
    if let Some((name, script)) = install_script(contents.device_type, contents.auto_connect) {
        archive.add(&format!("{}/{}", dir, name), script.as_bytes(), MODE_EXECUTABLE)?;
    }
    archive.add(&format!("{}/README.md", dir), readme(contents).as_bytes(), MODE_PUBLIC)?;
    archive.finish()
}

/// Script file name and body; mobile platforms get none
pub fn install_script(device: DeviceType, auto_connect: bool) -> Option<(&'static str, String)> {
    match device {
        DeviceType::Linux => Some(("install.sh", linux_script(auto_connect))),
        DeviceType::Macos => Some(("install.sh", macos_script(auto_connect))),
        DeviceType::Windows => Some(("install.bat", windows_script(auto_connect))),
        DeviceType::Android | DeviceType::Ios => None,
    }
}

fn linux_script(auto_connect: bool) -> String {
    let start = if auto_connect {
        "systemctl enable nebula\nsystemctl start nebula\n\necho \"Nebula VPN installed and started.\"\n"
    } else {
        "echo \"Nebula VPN installed. Start it with: sudo systemctl start nebula\"\n"
    };
    format!(
        r#"#!/bin/bash
# Nebula VPN installation script

set -e

if [ "$EUID" -ne 0 ]; then
    echo "Please run as root (sudo ./install.sh)"
    exit 1
fi

cd "$(dirname "$0")"

if ! command -v nebula &> /dev/null; then
    echo "Downloading Nebula {release}..."
    wget -q https://github.com/slackhq/nebula/releases/download/{release}/nebula-linux-amd64.tar.gz
    tar -xzf nebula-linux-amd64.tar.gz nebula
    install -m 0755 nebula /usr/local/bin/nebula
fi

mkdir -p {dir}
cp ca.crt host.crt host.key config.yaml {dir}/
chmod 600 {dir}/host.key

cat > /etc/systemd/system/nebula.service << 'SERVICE'
[Unit]
Description=Nebula VPN
Wants=network-online.target
After=network-online.target

[Service]
Type=simple
ExecStart=/usr/local/bin/nebula -config {dir}/config.yaml
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
SERVICE

systemctl daemon-reload
{start}"#,
        release = NEBULA_RELEASE,
        dir = UNIX_PKI_DIR,
        start = start,
    )
}

fn macos_script(auto_connect: bool) -> String {
    let start = if auto_connect {
        "sudo launchctl load /Library/LaunchDaemons/com.nebula.vpn.plist\n\necho \"Nebula VPN installed and started.\"\n"
    } else {
        "echo \"Nebula VPN installed. Start it with: sudo launchctl load /Library/LaunchDaemons/com.nebula.vpn.plist\"\n"
    };
    format!(
        r#"#!/bin/bash
# Nebula VPN installation script for macOS

set -e

cd "$(dirname "$0")"

if ! command -v nebula &> /dev/null; then
    echo "Downloading Nebula {release}..."
    curl -sLO https://github.com/slackhq/nebula/releases/download/{release}/nebula-darwin.zip
    unzip -o nebula-darwin.zip nebula
    sudo install -m 0755 nebula /usr/local/bin/nebula
fi

sudo mkdir -p {dir}
sudo cp ca.crt host.crt host.key config.yaml {dir}/
sudo chmod 600 {dir}/host.key

sudo tee /Library/LaunchDaemons/com.nebula.vpn.plist > /dev/null << 'PLIST'
<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.nebula.vpn</string>
    <key>ProgramArguments</key>
    <array>
        <string>/usr/local/bin/nebula</string>
        <string>-config</string>
        <string>{dir}/config.yaml</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
PLIST

{start}"#,
        release = NEBULA_RELEASE,
        dir = UNIX_PKI_DIR,
        start = start,
    )
}

fn windows_script(auto_connect: bool) -> String {
    let (start_mode, start) = if auto_connect {
        ("auto", "sc start NebulaVPN\r\necho Nebula VPN installed and started.\r\n")
    } else {
        ("demand", "echo Nebula VPN installed. Start it with: sc start NebulaVPN\r\n")
    };
    let body = format!(
        r#"@echo off
REM Nebula VPN installation script for Windows (run as Administrator)

cd /d "%~dp0"

if not exist "C:\Program Files\Nebula\nebula.exe" (
    echo Downloading Nebula {release}...
    powershell -Command "Invoke-WebRequest -Uri 'https://github.com/slackhq/nebula/releases/download/{release}/nebula-windows-amd64.zip' -OutFile 'nebula.zip'"
    powershell -Command "Expand-Archive -Force -Path 'nebula.zip' -DestinationPath 'C:\Program Files\Nebula\'"
)

if not exist "{dir}" mkdir "{dir}"
copy /Y ca.crt "{dir}\"
copy /Y host.crt "{dir}\"
copy /Y host.key "{dir}\"
copy /Y config.yaml "{dir}\"

sc create NebulaVPN binPath= "\"C:\Program Files\Nebula\nebula.exe\" -service run -config \"{dir}\config.yaml\"" start= {start_mode}
{start}pause
"#,
        release = NEBULA_RELEASE,
        dir = WINDOWS_PKI_DIR,
        start_mode = start_mode,
        start = start,
    );
    // Batch files want CRLF line endings.
    body.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn readme(contents: &PackageContents<'_>) -> String {
    let mut out = format!(
        "# Nebula VPN client package: {name}\n\n\
         Device type: {device}\n\
         Overlay address: {ip}\n\n\
         ## Contents\n\n\
         - `ca.crt`: certificate authority\n\
         - `host.crt`: this device's certificate\n\
         - `host.key`: this device's private key, keep it secret\n\
         - `config.yaml`: Nebula configuration\n",
        name = contents.device_name,
        device = contents.device_type,
        ip = contents.ip_address,
    );

    if let Some((script, _)) = install_script(contents.device_type, contents.auto_connect) {
        out.push_str(&format!("- `{}`: installer\n", script));
    }

    out.push_str("\n## Installation\n\n");
    match contents.device_type {
        DeviceType::Linux | DeviceType::Macos => out.push_str(&format!(
            "```bash\nchmod +x install.sh\nsudo ./install.sh\n```\n\n\
             The installer copies the files to `{}` and registers a service.\n",
            UNIX_PKI_DIR
        )),
        DeviceType::Windows => out.push_str(&format!(
            "Run `install.bat` as Administrator. Files are copied to `{}` and a \
             `NebulaVPN` service is registered.\n",
            WINDOWS_PKI_DIR
        )),
        DeviceType::Android | DeviceType::Ios => out.push_str(
            "Install the Mobile Nebula app, create a new site and import `ca.crt`, \
             `host.crt`, `host.key` and the settings from `config.yaml`.\n",
        ),
    }

    out.push_str(&format!(
        "\nManual setup: install Nebula from https://github.com/slackhq/nebula/releases \
         ({}) and run `nebula -config config.yaml`.\n",
        NEBULA_RELEASE
    ));

    if let Some(lighthouse) = contents.lighthouse_ip {
        let lighthouse = lighthouse.split('/').next().unwrap_or(lighthouse);
        out.push_str(&format!(
            "\n## Verify\n\nOnce connected the lighthouse should answer:\n\n```\nping {}\n```\n",
            lighthouse
        ));
    }

    out.push_str("\n## Security\n\nNever share `host.key`. Ask your administrator to revoke this device if it is lost.\n");
    out
}
