//! The single-page chat interface

pub const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Laama Chat</title>
<style>
  :root {
    --user: #42e59e;
    --assistant: #8f3dd0;
    --panel: rgba(14, 17, 23, 0.8);
    --text: #f5f5f5;
  }
  * { box-sizing: border-box; }
  body {
    margin: 0;
    height: 100vh;
    display: flex;
    font-family: system-ui, sans-serif;
    color: var(--text);
    background: #0e1117;
  }
  body::before {
    content: "";
    position: fixed;
    top: 0; left: 0; right: 0;
    height: 4px;
    background: linear-gradient(90deg, var(--assistant), var(--user));
  }
  aside {
    width: 280px;
    padding: 1rem;
    background: var(--panel);
    display: flex;
    flex-direction: column;
    gap: 0.75rem;
    overflow-y: auto;
  }
  aside h1 { font-size: 1.2rem; margin: 0.5rem 0; }
  aside ul { list-style: none; padding: 0; margin: 0; }
  aside li {
    display: flex;
    justify-content: space-between;
    padding: 0.4rem 0.5rem;
    border-radius: 6px;
    cursor: pointer;
  }
  aside li.active, aside li:hover { background: rgba(143, 61, 208, 0.25); }
  aside li button { background: none; border: none; color: #aaa; cursor: pointer; }
  main { flex: 1; display: flex; flex-direction: column; }
  #messages { flex: 1; overflow-y: auto; padding: 1.5rem; }
  .message {
    display: flex;
    gap: 0.75rem;
    margin-bottom: 1rem;
    padding: 1rem;
    border-radius: 10px;
    background: rgba(255, 255, 255, 0.04);
    white-space: pre-wrap;
  }
  .avatar {
    flex: none;
    width: 36px; height: 36px;
    border-radius: 50%;
    display: grid;
    place-items: center;
    font-weight: bold;
    color: #0e1117;
  }
  .user .avatar { background: var(--user); }
  .assistant .avatar { background: var(--assistant); color: var(--text); }
  .meta { font-size: 0.75rem; color: #999; margin-top: 0.4rem; }
  #status { padding: 0 1.5rem; min-height: 1.5rem; color: #f0a; }
  form { display: flex; gap: 0.5rem; padding: 1rem 1.5rem; background: var(--panel); }
  textarea { flex: 1; resize: none; padding: 0.6rem; border-radius: 8px; border: none; }
  button.primary {
    border: none;
    border-radius: 8px;
    padding: 0 1.2rem;
    color: var(--text);
    background: linear-gradient(135deg, var(--assistant), var(--user));
    cursor: pointer;
  }
  select, input[type=file] { width: 100%; }
</style>
</head>
<body>
<aside>
  <h1>Laama Chat</h1>
  <button class="primary" id="new-chat">New chat</button>
  <label>Model <select id="model"></select></label>
  <label>Document <input type="file" id="document"></label>
  <div id="document-name"></div>
  <h2>Chats</h2>
  <ul id="sessions"></ul>
</aside>
<main>
  <div id="messages"></div>
  <div id="status"></div>
  <form id="composer">
    <textarea id="input" rows="3" placeholder="Ask something..."></textarea>
    <button class="primary" type="submit">Send</button>
  </form>
</main>
<script>
const $ = (id) => document.getElementById(id);
let current = null;

async function api(method, path, body, headers) {
  const res = await fetch(path, { method, body, headers });
  if (res.status === 204) return null;
  const data = await res.json();
  if (!res.ok) throw data.error;
  return data;
}

function showError(err) {
  $("status").textContent = err.message + (err.retry ? " (retry available)" : "");
  if (err.retry) {
    const retry = document.createElement("button");
    retry.textContent = "Retry";
    retry.onclick = () => api("POST", "/v1/session/retry").then((r) => render(r.session)).catch(showError);
    $("status").append(" ", retry);
  }
}

function bubble(role, content, meta) {
  const div = document.createElement("div");
  div.className = "message " + role;
  const avatar = document.createElement("div");
  avatar.className = "avatar";
  avatar.textContent = role === "user" ? "U" : "AI";
  const body = document.createElement("div");
  body.textContent = content;
  if (meta) {
    const m = document.createElement("div");
    m.className = "meta";
    m.textContent = meta;
    body.append(m);
  }
  div.append(avatar, body);
  $("messages").append(div);
  return body;
}

function render(session) {
  current = session;
  $("messages").innerHTML = "";
  $("status").textContent = "";
  if (!session) return;
  for (const m of session.messages) {
    bubble(m.role, m.content, m.document ? "with " + m.document : m.model || "");
  }
  $("model").value = session.model_id;
  if (session.awaiting_reply) showError({ message: "The last message has no reply yet.", retry: true });
  refreshSessions();
}

async function refreshSessions() {
  const sessions = await api("GET", "/v1/sessions");
  $("sessions").innerHTML = "";
  for (const s of sessions) {
    const li = document.createElement("li");
    li.className = current && current.id === s.id ? "active" : "";
    li.textContent = s.title;
    li.onclick = () => api("GET", "/v1/sessions/" + s.id).then(render).catch(showError);
    const del = document.createElement("button");
    del.textContent = "x";
    del.onclick = async (e) => {
      e.stopPropagation();
      await api("DELETE", "/v1/sessions/" + s.id).catch(showError);
      if (current && current.id === s.id) render(null);
      refreshSessions();
    };
    li.append(del);
    $("sessions").append(li);
  }
}

async function streamMessage(text) {
  const res = await fetch("/v1/session/messages/stream", {
    method: "POST",
    headers: { "content-type": "application/json" },
    body: JSON.stringify({ message: text }),
  });
  if (!res.ok) throw (await res.json()).error;

  bubble("user", text);
  const target = bubble("assistant", "");
  const reader = res.body.getReader();
  const decoder = new TextDecoder();
  let buffer = "";
  for (;;) {
    const { value, done } = await reader.read();
    if (done) break;
    buffer += decoder.decode(value, { stream: true });
    let end;
    while ((end = buffer.indexOf("\n\n")) >= 0) {
      const raw = buffer.slice(0, end);
      buffer = buffer.slice(end + 2);
      let event = "message";
      const data = [];
      for (const line of raw.split("\n")) {
        if (line.startsWith("event:")) event = line.slice(6).trim();
        else if (line.startsWith("data:")) data.push(line.slice(5).replace(/^ /, ""));
      }
      const payload = data.join("\n");
      if (event === "chunk") target.textContent += JSON.parse(payload).text;
      else if (event === "done") render(JSON.parse(payload));
      else if (event === "error") showError(JSON.parse(payload));
    }
  }
}

$("composer").onsubmit = async (e) => {
  e.preventDefault();
  const text = $("input").value.trim();
  if (!text) return;
  $("input").value = "";
  $("status").textContent = "";
  await streamMessage(text).catch(showError);
};

$("new-chat").onclick = () =>
  api("POST", "/v1/sessions", JSON.stringify({}), { "content-type": "application/json" })
    .then(render)
    .catch(showError);

$("model").onchange = () => {
  if (!current) return;
  api("PUT", "/v1/session/model", JSON.stringify({ model: $("model").value }), {
    "content-type": "application/json",
  }).then(render).catch(showError);
};

$("document").onchange = async () => {
  const file = $("document").files[0];
  if (!file) {
    await api("DELETE", "/v1/session/document");
    $("document-name").textContent = "";
    return;
  }
  api("PUT", "/v1/session/document?name=" + encodeURIComponent(file.name), file, {
    "content-type": file.type || "application/octet-stream",
  })
    .then((doc) => ($("document-name").textContent = doc.name + " (" + doc.chars + " chars)"))
    .catch(showError);
};

(async () => {
  const models = await api("GET", "/v1/models");
  for (const m of models.models) {
    const opt = document.createElement("option");
    opt.value = m.id;
    opt.textContent = m.name;
    $("model").append(opt);
  }
  $("model").value = models.default;
  const state = await api("GET", "/v1/session");
  if (state.document) $("document-name").textContent = state.document.name;
  render(state.session);
  refreshSessions();
})();
</script>
</body>
</html>
"##;
