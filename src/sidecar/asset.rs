//! Embedded JavaScript shipped with the binary.
//!
//! The overlay network is only reachable through its Node SDK, so the
//! bridge script and the one-shot wallet snippet live here and are
//! materialized into the sidecar directory on demand. Installing the
//! `nkn-sdk` package itself is deployment's job, not ours.

/// File name the bridge script is written under.
pub const SIDECAR_FILE_NAME: &str = "sidecar.js";

/// The NDJSON bridge: an NKN MultiClient wired to stdin/stdout.
pub const SIDECAR_SOURCE: &str = r#"
const readline = require('readline');
const { MultiClient } = require('nkn-sdk');
function ndj(obj){ try{ process.stdout.write(JSON.stringify(obj)+"\n"); }catch{} }
(async () => {
  const identifier = (process.env.NKN_IDENTIFIER || 'forwarder').trim();
  const seed = (process.env.NKN_SEED || '').trim() || undefined;
  const numSubClients = Math.max(1, parseInt(process.env.NKN_SUBCLIENTS || '4', 10));
  const rpcStr = (process.env.NKN_RPC_ADDRS || '').trim();
  const rpcServerAddr = rpcStr ? rpcStr.split(',').map(s=>s.trim()).filter(Boolean) : undefined;
  const seedRpcServerAddr = (process.env.NKN_SEED_RPC_ADDRS || '').split(',').map(s=>s.trim()).filter(Boolean);
  const seedWsAddr = (process.env.NKN_SEED_WS_ADDRS || '').split(',').map(s=>s.trim()).filter(Boolean);
  const responseTimeout = Math.max(5000, parseInt(process.env.NKN_RESPONSE_TIMEOUT_MS || '20000', 10) || 20000);
  const msgHoldingSeconds = Math.max(30, parseInt(process.env.NKN_MSG_HOLDING_S || '90', 10) || 90);
  const wsConnHeartbeatTimeout = Math.max(30000, parseInt(process.env.NKN_WS_HEARTBEAT_MS || '120000', 10) || 120000);
  let mc;
  try { mc = new MultiClient({
      identifier,
      seed,
      numSubClients,
      originalClient: false,
      rpcServerAddr,
      seedRpcServerAddr: seedRpcServerAddr.length ? seedRpcServerAddr : undefined,
      seedWsAddr: seedWsAddr.length ? seedWsAddr : undefined,
      tls: true,
      responseTimeout,
      msgHoldingSeconds,
      msgCacheExpiration: 300000,
      reconnectIntervalMin: 1000,
      reconnectIntervalMax: 8000,
      wsConnHeartbeatTimeout
    }); }
  catch (e) { ndj({ ev:"error", message: String(e && e.message || e) }); process.exit(1); }
  mc.onConnect(() => ndj({ ev:"ready", addr: mc.addr }));
  mc.onMessage(({ src, payload }) => {
    try { const buf = (typeof payload === 'string') ? Buffer.from(payload) : Buffer.from(payload);
      ndj({ ev:"message", src, payload_b64: buf.toString('base64') }); }
    catch (e) { ndj({ ev:"error", message: "onMessage decode: "+(e && e.message || e) }); }
  });
  const rl = readline.createInterface({ input: process.stdin, crlfDelay: Infinity });
  rl.on('line', async (line) => {
    let msg; try { msg = JSON.parse(line); } catch { return; }
    if (msg.op === 'send') {
      try { const dest = String(msg.dest || '').trim(); if (!dest) return ndj({ ev:"error", message:"missing dest", id: msg.id });
        const data = msg.payload_b64 ? Buffer.from(msg.payload_b64, 'base64') : Buffer.alloc(0);
        await mc.send(dest, data); ndj({ ev:"sent", id: msg.id, dest }); }
      catch (e) { ndj({ ev:"error", id: msg.id, message: String(e && e.message || e) }); }
    } else if (msg.op === 'close') { try { await mc.close(); } catch {} process.exit(0); }
  });
  process.on('SIGINT', async ()=>{ try{ await mc.close(); }catch{} process.exit(0); });
  process.on('SIGTERM', async ()=>{ try{ await mc.close(); }catch{} process.exit(0); });
})();
"#;

/// One-shot wallet creation: prints a fresh seed to stdout, nothing else.
/// Run with `node -e` from the sidecar directory so `nkn-sdk` resolves.
pub const WALLET_SNIPPET: &str = r#"
const { Wallet } = require('nkn-sdk');
const w = new Wallet();
const s = (typeof w.getSeed==='function') ? w.getSeed() : (w.seed || '');
if (!s) { process.stderr.write('no-seed'); process.exit(1); }
process.stdout.write(s);
"#;
